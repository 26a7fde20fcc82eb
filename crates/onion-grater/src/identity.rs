//! Client identification from OS-level connection attributes.
//!
//! Loopback clients are identified by walking `/proc/net/tcp` (and `tcp6`)
//! for the socket whose *local* endpoint equals the accepted connection's
//! remote endpoint, then mapping its inode through `/proc/<pid>/fd` to the
//! owning process. From the PID we read the AppArmor confinement label and
//! the process owner's username. Remote clients are identified by source
//! IP only.
//!
//! The PID lookup is inherently racy (the peer can die between accept and
//! the walk); when it fails the session is aborted before the client sees
//! any response.

use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::error::{GraterError, Result};

/// Identity attributes of one accepted connection.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub kind: IdentityKind,
}

/// Loopback clients carry process attributes, remote clients only their
/// source address.
#[derive(Debug, Clone)]
pub enum IdentityKind {
    Loopback {
        pid: i32,
        apparmor_profile: String,
        username: String,
    },
    Remote {
        host: IpAddr,
    },
}

impl ClientIdentity {
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        matches!(self.kind, IdentityKind::Loopback { .. })
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IdentityKind::Loopback {
                pid,
                apparmor_profile,
                username,
            } => write!(
                f,
                "{} (pid {pid}, profile {apparmor_profile:?}, user {username:?})",
                self.remote_addr
            ),
            IdentityKind::Remote { host } => write!(f, "{} (remote {host})", self.remote_addr),
        }
    }
}

/// Resolve the identity of a newly accepted connection.
///
/// Fails with [`GraterError::PeerNotFound`] when a loopback peer cannot be
/// mapped to a process (the client died during the handshake); the caller
/// drops the connection without a response.
pub fn resolve(local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<ClientIdentity> {
    let kind = if remote_addr.ip().is_loopback() {
        let pid = find_peer_pid(remote_addr)?;
        IdentityKind::Loopback {
            pid,
            apparmor_profile: apparmor_profile(pid),
            username: process_username(pid),
        }
    } else {
        IdentityKind::Remote {
            host: remote_addr.ip(),
        }
    };
    Ok(ClientIdentity {
        local_addr,
        remote_addr,
        kind,
    })
}

/// Locate the process whose local TCP endpoint equals `addr`.
fn find_peer_pid(addr: SocketAddr) -> Result<i32> {
    let inode = socket_inode(addr)?.ok_or_else(|| GraterError::PeerNotFound {
        addr: addr.to_string(),
    })?;
    pid_of_socket_inode(inode).ok_or_else(|| GraterError::PeerNotFound {
        addr: addr.to_string(),
    })
}

/// Inode of the socket bound locally to `addr`, from the kernel's TCP
/// tables.
fn socket_inode(addr: SocketAddr) -> Result<Option<u64>> {
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let content = match fs::read_to_string(table) {
            Ok(c) => c,
            Err(e) => {
                debug!("cannot read {table}: {e}");
                continue;
            }
        };
        if let Some(inode) = find_inode_in_table(&content, addr) {
            return Ok(Some(inode));
        }
    }
    Ok(None)
}

/// Scan one `/proc/net/tcp*` table for a socket whose local endpoint
/// equals `addr`.
fn find_inode_in_table(content: &str, addr: SocketAddr) -> Option<u64> {
    content
        .lines()
        .skip(1)
        .filter_map(parse_proc_net_entry)
        .find(|(local, _)| socket_addrs_equal(*local, addr))
        .map(|(_, inode)| inode)
}

/// Parse one row of `/proc/net/tcp` or `/proc/net/tcp6` into its local
/// endpoint and socket inode.
fn parse_proc_net_entry(line: &str) -> Option<(SocketAddr, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // sl local_address rem_address st ... uid timeout inode
    if fields.len() < 10 {
        return None;
    }
    let local = parse_hex_endpoint(fields[1])?;
    let inode = fields[9].parse::<u64>().ok()?;
    Some((local, inode))
}

/// Decode the kernel's `ADDR:PORT` hex notation. IPv4 addresses are one
/// little-endian u32; IPv6 addresses are four of them.
fn parse_hex_endpoint(s: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip: IpAddr = match addr_hex.len() {
        8 => {
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            Ipv4Addr::from(raw.to_le_bytes()).into()
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
                let chunk = std::str::from_utf8(chunk).ok()?;
                let raw = u32::from_str_radix(chunk, 16).ok()?;
                bytes[i * 4..i * 4 + 4].copy_from_slice(&raw.to_le_bytes());
            }
            Ipv6Addr::from(bytes).into()
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Endpoint equality across the v4/v6 boundary: a v4 connection may show
/// up v4-mapped in `/proc/net/tcp6`.
fn socket_addrs_equal(a: SocketAddr, b: SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }
    canonical_ip(a.ip()) == canonical_ip(b.ip())
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Find the PID holding a socket with the given inode by walking
/// `/proc/<pid>/fd`.
fn pid_of_socket_inode(inode: u64) -> Option<i32> {
    let target = format!("socket:[{inode}]");
    let entries = fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        // Unreadable fd dirs (other users' processes) are skipped.
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = fs::read_link(fd.path()) {
                if link.as_os_str() == target.as_str() {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// AppArmor confinement label of a process, falling back to its
/// executable path when the process is unconfined or the attribute is
/// unavailable.
fn apparmor_profile(pid: i32) -> String {
    for attr in [
        format!("/proc/{pid}/attr/apparmor/current"),
        format!("/proc/{pid}/attr/current"),
    ] {
        if let Ok(raw) = fs::read_to_string(&attr) {
            let label = raw.trim_end_matches(['\0', '\n']);
            if let Some(profile) = confined_profile_name(label) {
                return profile.to_string();
            }
        }
    }
    executable_path(pid)
}

/// Extract the profile name from a confined label such as
/// `/usr/bin/app (enforce)`.
fn confined_profile_name(label: &str) -> Option<&str> {
    // Compiled per call; identification happens once per connection.
    let re = Regex::new(r"^(.+) \((?:complain|enforce)\)$").expect("label pattern is valid");
    re.captures(label)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn executable_path(pid: i32) -> String {
    fs::read_link(format!("/proc/{pid}/exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Username of the process owner, from the uid owning `/proc/<pid>`.
fn process_username(pid: i32) -> String {
    let uid = match fs::metadata(Path::new("/proc").join(pid.to_string())) {
        Ok(meta) => meta.uid(),
        Err(_) => return String::new(),
    };
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_endpoint_v4() {
        let addr = parse_hex_endpoint("0100007F:0035").unwrap();
        assert_eq!(addr, "127.0.0.1:53".parse().unwrap());
    }

    #[test]
    fn test_parse_hex_endpoint_v6_loopback() {
        let addr = parse_hex_endpoint("00000000000000000000000001000000:0FC8").unwrap();
        assert_eq!(addr, "[::1]:4040".parse().unwrap());
    }

    #[test]
    fn test_parse_hex_endpoint_rejects_garbage() {
        assert!(parse_hex_endpoint("nonsense").is_none());
        assert!(parse_hex_endpoint("0100007F").is_none());
        assert!(parse_hex_endpoint("0100:0035").is_none());
    }

    #[test]
    fn test_parse_proc_net_entry() {
        let line = "   1: 0100007F:D431 0100007F:03B7 01 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 20 4 30 10 -1";
        let (local, inode) = parse_proc_net_entry(line).unwrap();
        assert_eq!(local, "127.0.0.1:54321".parse().unwrap());
        assert_eq!(inode, 123_456);
    }

    #[test]
    fn test_find_inode_in_table_matches_v4_mapped() {
        // A 127.0.0.1 client can appear v4-mapped in tcp6.
        let table = "  sl  local_address rem_address ...\n   0: 0000000000000000FFFF00000100007F:D431 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 777 1 0000000000000000 100 0 0 10 0";
        let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();
        assert_eq!(find_inode_in_table(table, addr), Some(777));
    }

    #[test]
    fn test_confined_profile_name() {
        assert_eq!(
            confined_profile_name("/usr/bin/onionshare (enforce)"),
            Some("/usr/bin/onionshare")
        );
        assert_eq!(
            confined_profile_name("custom_profile (complain)"),
            Some("custom_profile")
        );
        assert_eq!(confined_profile_name("unconfined"), None);
        assert_eq!(confined_profile_name("/usr/bin/app (kill)"), None);
    }

    #[test]
    fn test_remote_identity() {
        let id = resolve(
            "10.200.1.1:951".parse().unwrap(),
            "10.200.1.5:40000".parse().unwrap(),
        )
        .unwrap();
        assert!(!id.is_loopback());
        match id.kind {
            IdentityKind::Remote { host } => assert_eq!(host, "10.200.1.5".parse::<IpAddr>().unwrap()),
            IdentityKind::Loopback { .. } => panic!("expected remote identity"),
        }
    }
}
