//! Policy schema, loading, and client matching.
//!
//! Policies are YAML files in the policy directory. The raw schema structs
//! here match the on-disk format; [`rules::compile`](crate::rules::compile)
//! turns them into the anchored rule tables sessions consult. The store is
//! built once at startup and shared immutably.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{GraterError, Result};
use crate::identity::{ClientIdentity, IdentityKind};
use crate::rules::{self, CompiledRules};

/// A response or event rewrite rule in source form.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleSpec {
    pub pattern: String,
    pub replacement: String,
}

/// A command argument rule in source form. A bare string is shorthand for
/// a rule with only a pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgRuleSpec {
    Pattern(String),
    Full {
        pattern: String,
        #[serde(default)]
        replacement: Option<String>,
        #[serde(default)]
        response: Vec<RewriteRuleSpec>,
    },
}

impl ArgRuleSpec {
    #[must_use]
    pub fn pattern(&self) -> &str {
        match self {
            ArgRuleSpec::Pattern(p) => p,
            ArgRuleSpec::Full { pattern, .. } => pattern,
        }
    }

    #[must_use]
    pub fn replacement(&self) -> Option<&str> {
        match self {
            ArgRuleSpec::Pattern(_) => None,
            ArgRuleSpec::Full { replacement, .. } => replacement.as_deref(),
        }
    }

    #[must_use]
    pub fn response(&self) -> &[RewriteRuleSpec] {
        match self {
            ArgRuleSpec::Pattern(_) => &[],
            ArgRuleSpec::Full { response, .. } => response,
        }
    }
}

/// An event rule in source form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventRuleSpec {
    #[serde(default)]
    pub suppress: bool,
    #[serde(default)]
    pub response: Vec<RewriteRuleSpec>,
}

/// On-disk policy schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicyFile {
    /// Label; defaults to the file's base name when absent.
    pub name: Option<String>,
    /// AppArmor profile names this policy applies to; `*` matches any.
    pub apparmor_profiles: Vec<String>,
    /// Usernames this policy applies to; `*` matches any.
    pub users: Vec<String>,
    /// Source IPs (textual IPv4) for remote clients; `*` matches any.
    pub hosts: Vec<String>,
    /// Command verb to ordered argument rules.
    pub commands: HashMap<String, Vec<ArgRuleSpec>>,
    /// Configuration keys: null permits reading only, a value list permits
    /// assignment (an empty string in the list permits reset).
    pub confs: HashMap<String, Option<Vec<String>>>,
    /// Event name to event rule.
    pub events: HashMap<String, EventRuleSpec>,
    /// Scope stream events to streams originated by the client.
    pub restrict_stream_events: bool,
}

/// A loaded, normalised policy with its compiled rule tables.
#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    apparmor_profiles: Vec<String>,
    users: Vec<String>,
    hosts: Vec<String>,
    rules: Arc<CompiledRules>,
}

impl Policy {
    /// Normalise and compile a parsed policy file. `fallback_name` is used
    /// when the file carries no `name` key.
    pub fn from_file(file: PolicyFile, fallback_name: &str) -> Result<Self> {
        let rules = rules::compile(&file)?;
        Ok(Self {
            name: file.name.unwrap_or_else(|| fallback_name.to_string()),
            apparmor_profiles: file.apparmor_profiles,
            users: file.users,
            hosts: file.hosts,
            rules: Arc::new(rules),
        })
    }

    /// Whether this policy applies to the given client.
    ///
    /// Loopback clients must match on both the AppArmor profile and the
    /// username; remote clients match on the source IP. Each qualifier
    /// matches when a listed value equals the identity's value or is `*`.
    #[must_use]
    pub fn matches(&self, identity: &ClientIdentity) -> bool {
        match &identity.kind {
            IdentityKind::Loopback {
                apparmor_profile,
                username,
                ..
            } => {
                qualifier_matches(&self.apparmor_profiles, apparmor_profile)
                    && qualifier_matches(&self.users, username)
            }
            IdentityKind::Remote { host } => qualifier_matches(&self.hosts, &host.to_string()),
        }
    }

    /// The compiled rule tables.
    #[must_use]
    pub fn rules(&self) -> Arc<CompiledRules> {
        Arc::clone(&self.rules)
    }
}

fn qualifier_matches(listed: &[String], value: &str) -> bool {
    listed.iter().any(|v| v == "*" || v == value)
}

/// Immutable collection of all loaded policies.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: Vec<Policy>,
}

impl PolicyStore {
    /// Load every `*.yml` file under `dir`. Files that fail to parse or
    /// compile are logged and skipped; the rest of the directory loads.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut policies = Vec::new();
        let entries = fs::read_dir(dir).map_err(|source| GraterError::PolicyParse {
            path: dir.to_path_buf(),
            reason: source.to_string(),
        })?;
        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "yml"))
            .collect();
        paths.sort();

        for path in paths {
            match Self::load_file(&path) {
                Ok(policy) => {
                    debug!(policy = %policy.name, path = %path.display(), "loaded policy");
                    policies.push(policy);
                }
                Err(e) => warn!(path = %path.display(), "skipping policy: {e}"),
            }
        }
        Ok(Self { policies })
    }

    fn load_file(path: &Path) -> Result<Policy> {
        let content = fs::read_to_string(path).map_err(|source| GraterError::PolicyParse {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;
        let file: PolicyFile =
            serde_yaml::from_str(&content).map_err(|source| GraterError::PolicyParse {
                path: path.to_path_buf(),
                reason: source.to_string(),
            })?;
        let fallback = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Policy::from_file(file, &fallback)
    }

    /// Build a store from already-constructed policies.
    #[must_use]
    pub fn from_policies(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// Number of loaded policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Select the policy for a client.
    ///
    /// Zero matches is a valid outcome (the session runs with an empty
    /// rule table); more than one match is a configuration error and the
    /// session must be refused.
    pub fn select(&self, identity: &ClientIdentity) -> Result<Option<&Policy>> {
        let matching: Vec<&Policy> = self
            .policies
            .iter()
            .filter(|p| p.matches(identity))
            .collect();
        match matching.len() {
            0 => Ok(None),
            1 => Ok(Some(matching[0])),
            count => Err(GraterError::AmbiguousPolicy {
                client: identity.to_string(),
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;
    use std::net::SocketAddr;

    fn loopback_identity(profile: &str, user: &str) -> ClientIdentity {
        ClientIdentity {
            local_addr: "127.0.0.1:951".parse::<SocketAddr>().unwrap(),
            remote_addr: "127.0.0.1:54321".parse::<SocketAddr>().unwrap(),
            kind: IdentityKind::Loopback {
                pid: 4242,
                apparmor_profile: profile.to_string(),
                username: user.to_string(),
            },
        }
    }

    fn remote_identity(host: &str) -> ClientIdentity {
        ClientIdentity {
            local_addr: "10.200.1.1:951".parse::<SocketAddr>().unwrap(),
            remote_addr: format!("{host}:40000").parse::<SocketAddr>().unwrap(),
            kind: IdentityKind::Remote {
                host: host.parse().unwrap(),
            },
        }
    }

    fn policy(yaml: &str, fallback: &str) -> Policy {
        let file: PolicyFile = serde_yaml::from_str(yaml).expect("valid yaml");
        Policy::from_file(file, fallback).expect("compiles")
    }

    #[test]
    fn test_bare_string_rule_is_pattern_shorthand() {
        let file: PolicyFile = serde_yaml::from_str(
            "commands:\n  SIGNAL:\n    - 'NEWNYM'\n    - pattern: 'RELOAD'\n      replacement: 'RELOAD'\n",
        )
        .unwrap();
        let rules = &file.commands["SIGNAL"];
        assert_eq!(rules[0].pattern(), "NEWNYM");
        assert!(rules[0].replacement().is_none());
        assert_eq!(rules[1].pattern(), "RELOAD");
        assert_eq!(rules[1].replacement(), Some("RELOAD"));
    }

    #[test]
    fn test_name_defaults_to_file_stem_only_when_absent() {
        let named = policy("name: explicit\n", "fallback");
        assert_eq!(named.name, "explicit");
        let unnamed = policy("users: ['*']\n", "fallback");
        assert_eq!(unnamed.name, "fallback");
    }

    #[test]
    fn test_kebab_case_keys() {
        let file: PolicyFile = serde_yaml::from_str(
            "apparmor-profiles:\n  - '/usr/bin/app'\nrestrict-stream-events: true\n",
        )
        .unwrap();
        assert_eq!(file.apparmor_profiles, vec!["/usr/bin/app"]);
        assert!(file.restrict_stream_events);
    }

    #[test]
    fn test_loopback_match_requires_profile_and_user() {
        let p = policy(
            "apparmor-profiles: ['/usr/bin/app']\nusers: ['amnesia']\n",
            "p",
        );
        assert!(p.matches(&loopback_identity("/usr/bin/app", "amnesia")));
        assert!(!p.matches(&loopback_identity("/usr/bin/app", "root")));
        assert!(!p.matches(&loopback_identity("/usr/bin/other", "amnesia")));
    }

    #[test]
    fn test_wildcard_qualifier() {
        let p = policy("apparmor-profiles: ['*']\nusers: ['*']\n", "p");
        assert!(p.matches(&loopback_identity("/whatever", "whoever")));
        // Wildcard loopback qualifiers say nothing about remote clients.
        assert!(!p.matches(&remote_identity("10.200.1.5")));
    }

    #[test]
    fn test_remote_match_on_host() {
        let p = policy("hosts: ['10.200.1.5']\n", "p");
        assert!(p.matches(&remote_identity("10.200.1.5")));
        assert!(!p.matches(&remote_identity("10.200.1.6")));
        assert!(!p.matches(&loopback_identity("10.200.1.5", "user")));
    }

    #[test]
    fn test_select_zero_one_many() {
        let store = PolicyStore::from_policies(vec![
            policy("users: ['alice']\napparmor-profiles: ['*']\n", "a"),
            policy("users: ['alice']\napparmor-profiles: ['*']\n", "b"),
            policy("users: ['bob']\napparmor-profiles: ['*']\n", "c"),
        ]);
        assert!(store
            .select(&loopback_identity("/x", "nobody"))
            .unwrap()
            .is_none());
        let selected = store.select(&loopback_identity("/x", "bob")).unwrap();
        assert_eq!(selected.unwrap().name, "c");
        let err = store.select(&loopback_identity("/x", "alice")).unwrap_err();
        assert!(matches!(err, GraterError::AmbiguousPolicy { count: 2, .. }));
    }

    #[test]
    fn test_store_load_skips_broken_files() {
        let dir = tempfile::tempdir().expect("tmpdir");
        fs::write(
            dir.path().join("good.yml"),
            "users: ['*']\napparmor-profiles: ['*']\ncommands:\n  GETINFO:\n    - 'version'\n",
        )
        .unwrap();
        fs::write(dir.path().join("broken.yml"), ": not yaml : [").unwrap();
        fs::write(
            dir.path().join("badpattern.yml"),
            "commands:\n  GETINFO:\n    - '(unclosed'\n",
        )
        .unwrap();
        fs::write(dir.path().join("ignored.txt"), "not a policy").unwrap();

        let store = PolicyStore::load(dir.path()).expect("load");
        assert_eq!(store.len(), 1);
        assert_eq!(store.policies[0].name, "good");
    }
}
