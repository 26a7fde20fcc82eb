//! Rule compilation: from the parsed policy schema to the per-session
//! rule tables.
//!
//! Compilation happens once, at policy load time. Every pattern is compiled
//! fully anchored over the argument (or line) it applies to, so a rule
//! matches the whole string or not at all. Replacement strings are parsed
//! into [`Template`]s supporting positional group captures (`{}`, `{0}`)
//! and the named placeholders `{client-address}`, `{client-port}`,
//! `{server-address}`, `{server-port}`.
//!
//! `GETCONF`/`SETCONF` rules are synthesised from the policy's `confs`
//! mapping so that configuration access never needs hand-written command
//! patterns.

use std::collections::HashMap;

use regex::{Captures, Regex};

use crate::error::{GraterError, Result};
use crate::policy::{ArgRuleSpec, EventRuleSpec, PolicyFile, RewriteRuleSpec};

/// One segment of a parsed replacement template.
#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `{}` — next positional capture.
    Auto,
    /// `{N}` — capture N (zero-based over the pattern's groups).
    Index(usize),
    Placeholder(Placeholder),
}

/// Named placeholders resolved from the session's socket addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    ClientAddress,
    ClientPort,
    ServerAddress,
    ServerPort,
}

/// Socket-address values substituted for named template placeholders.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderContext {
    pub client_address: String,
    pub client_port: String,
    pub server_address: String,
    pub server_port: String,
}

/// A parsed replacement template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a replacement string.
    ///
    /// `{{` and `}}` are literal braces. `{}` consumes the next capture
    /// group, `{N}` names one explicitly, and the four `{client-*}` /
    /// `{server-*}` placeholders come from the session context.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => field.push(c),
                            None => {
                                return Err(GraterError::Template {
                                    template: source.to_string(),
                                    reason: "unterminated placeholder".to_string(),
                                })
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Self::field_segment(source, &field)?);
                }
                '}' => {
                    return Err(GraterError::Template {
                        template: source.to_string(),
                        reason: "unmatched '}'".to_string(),
                    })
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    fn field_segment(source: &str, field: &str) -> Result<Segment> {
        match field {
            "" => Ok(Segment::Auto),
            "client-address" => Ok(Segment::Placeholder(Placeholder::ClientAddress)),
            "client-port" => Ok(Segment::Placeholder(Placeholder::ClientPort)),
            "server-address" => Ok(Segment::Placeholder(Placeholder::ServerAddress)),
            "server-port" => Ok(Segment::Placeholder(Placeholder::ServerPort)),
            _ => field
                .parse::<usize>()
                .map(Segment::Index)
                .map_err(|_| GraterError::Template {
                    template: source.to_string(),
                    reason: format!("unknown placeholder {{{field}}}"),
                }),
        }
    }

    /// Render the template against the captures of a matched pattern.
    ///
    /// Positional fields are zero-based over the pattern's capture groups.
    /// A referenced group that did not participate in the match renders
    /// empty; a group index beyond the pattern's group count is an error.
    pub fn render(&self, caps: &Captures<'_>, ctx: &PlaceholderContext) -> Result<String> {
        let mut out = String::new();
        let mut next_auto = 0usize;
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Auto => {
                    self.push_group(&mut out, caps, next_auto)?;
                    next_auto += 1;
                }
                Segment::Index(i) => self.push_group(&mut out, caps, *i)?,
                Segment::Placeholder(p) => out.push_str(match p {
                    Placeholder::ClientAddress => &ctx.client_address,
                    Placeholder::ClientPort => &ctx.client_port,
                    Placeholder::ServerAddress => &ctx.server_address,
                    Placeholder::ServerPort => &ctx.server_port,
                }),
            }
        }
        Ok(out)
    }

    fn push_group(&self, out: &mut String, caps: &Captures<'_>, index: usize) -> Result<()> {
        if index + 1 >= caps.len() {
            return Err(GraterError::Rewrite {
                line: self.source.clone(),
                reason: format!(
                    "template references group {} but the pattern has {}",
                    index,
                    caps.len() - 1
                ),
            });
        }
        if let Some(m) = caps.get(index + 1) {
            out.push_str(m.as_str());
        }
        Ok(())
    }
}

/// A single response (or event) rewrite rule: anchored pattern plus
/// replacement template. First matching rule wins per line.
#[derive(Debug, Clone)]
pub struct ResponseRewrite {
    pattern: Regex,
    template: Template,
}

impl ResponseRewrite {
    fn compile(spec: &RewriteRuleSpec) -> Result<Self> {
        Ok(Self {
            pattern: anchored(&spec.pattern)?,
            template: Template::parse(&spec.replacement)?,
        })
    }

    /// Apply this rule to one line. Returns `None` when the pattern does
    /// not match the whole line.
    pub fn apply(&self, line: &str, ctx: &PlaceholderContext) -> Result<Option<String>> {
        match self.pattern.captures(line) {
            Some(caps) => Ok(Some(self.template.render(&caps, ctx)?)),
            None => Ok(None),
        }
    }
}

/// Rewrite a block of reply or event lines, first-match-wins per line.
/// Lines no rule matches pass through verbatim.
pub fn rewrite_lines(
    lines: &[String],
    rules: &[ResponseRewrite],
    ctx: &PlaceholderContext,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let mut rewritten = None;
        for rule in rules {
            if let Some(r) = rule.apply(line, ctx)? {
                rewritten = Some(r);
                break;
            }
        }
        out.push(rewritten.unwrap_or_else(|| line.clone()));
    }
    Ok(out)
}

/// A compiled command rule: anchored argument pattern, optional argument
/// replacement, optional response rewrites.
#[derive(Debug, Clone)]
pub struct CompiledArgRule {
    pattern: Regex,
    replacement: Option<Template>,
    response: Vec<ResponseRewrite>,
}

impl CompiledArgRule {
    fn compile(spec: &ArgRuleSpec) -> Result<Self> {
        let response = spec
            .response()
            .iter()
            .map(ResponseRewrite::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pattern: anchored(spec.pattern())?,
            replacement: spec.replacement().map(Template::parse).transpose()?,
            response,
        })
    }

    /// A rule that matches anything and rewrites nothing. Used when global
    /// filtering is disabled and no configured rule matched.
    #[must_use]
    pub fn pass_through() -> Self {
        Self {
            pattern: Regex::new("^(?s:.*)$").expect("pass-through pattern is valid"),
            replacement: None,
            response: Vec::new(),
        }
    }

    /// Whether the rule's anchored pattern matches the full argument string.
    #[must_use]
    pub fn matches(&self, args: &str) -> bool {
        self.pattern.is_match(args)
    }

    /// Rewrite the argument string when the rule carries a replacement.
    ///
    /// Returns `None` for rules without a replacement. The caller has
    /// already established the pattern matches; a failure to capture here
    /// is an internal error in the rule set.
    pub fn rewrite_args(&self, args: &str, ctx: &PlaceholderContext) -> Result<Option<String>> {
        let Some(template) = &self.replacement else {
            return Ok(None);
        };
        let caps = self
            .pattern
            .captures(args)
            .ok_or_else(|| GraterError::Rewrite {
                line: args.to_string(),
                reason: "argument pattern no longer matches".to_string(),
            })?;
        template.render(&caps, ctx).map(Some)
    }

    /// Response rewrite rules attached to this command rule.
    #[must_use]
    pub fn response_rewrites(&self) -> &[ResponseRewrite] {
        &self.response
    }
}

/// A compiled event rule.
#[derive(Debug, Clone)]
pub struct CompiledEventRule {
    pub suppress: bool,
    pub response: Vec<ResponseRewrite>,
}

impl CompiledEventRule {
    fn compile(spec: &EventRuleSpec) -> Result<Self> {
        Ok(Self {
            suppress: spec.suppress,
            response: spec
                .response
                .iter()
                .map(ResponseRewrite::compile)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// The flat rule tables a session consults on every request.
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    pub allowed_commands: HashMap<String, Vec<CompiledArgRule>>,
    pub allowed_events: HashMap<String, CompiledEventRule>,
    pub restrict_stream_events: bool,
}

impl CompiledRules {
    /// The empty rule table: every command is filtered, every event
    /// subscription rejected.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// First rule in the verb's ordered list whose pattern matches the
    /// full argument string.
    #[must_use]
    pub fn lookup(&self, verb: &str, args: &str) -> Option<&CompiledArgRule> {
        self.allowed_commands
            .get(verb)?
            .iter()
            .find(|rule| rule.matches(args))
    }
}

/// Expand a policy file into its compiled rule tables.
///
/// Verb and event keys are upper-cased; `confs` is expanded into synthetic
/// `GETCONF`/`SETCONF` rules appended to the command table.
pub fn compile(file: &PolicyFile) -> Result<CompiledRules> {
    let mut allowed_commands: HashMap<String, Vec<CompiledArgRule>> = HashMap::new();

    for (verb, specs) in &file.commands {
        let rules = specs
            .iter()
            .map(CompiledArgRule::compile)
            .collect::<Result<Vec<_>>>()?;
        allowed_commands
            .entry(verb.to_uppercase())
            .or_default()
            .extend(rules);
    }

    if let Some(pattern) = getconf_pattern(file) {
        allowed_commands
            .entry("GETCONF".to_string())
            .or_default()
            .push(CompiledArgRule {
                pattern: anchored(&pattern)?,
                replacement: None,
                response: Vec::new(),
            });
    }
    if let Some(pattern) = setconf_pattern(file) {
        allowed_commands
            .entry("SETCONF".to_string())
            .or_default()
            .push(CompiledArgRule {
                pattern: anchored(&pattern)?,
                replacement: None,
                response: Vec::new(),
            });
    }

    let mut allowed_events = HashMap::new();
    for (name, spec) in &file.events {
        allowed_events.insert(name.to_uppercase(), CompiledEventRule::compile(spec)?);
    }

    Ok(CompiledRules {
        allowed_commands,
        allowed_events,
        restrict_stream_events: file.restrict_stream_events,
    })
}

/// Case-insensitive alternation over every key in `confs`.
fn getconf_pattern(file: &PolicyFile) -> Option<String> {
    if file.confs.is_empty() {
        return None;
    }
    let keys: Vec<String> = file.confs.keys().map(|k| regex::escape(k)).collect();
    Some(format!("(?i:{})", keys.join("|")))
}

/// A whitespace-separated sequence of permitted `SETCONF` items: bare keys
/// for reset (keys whose value list contains the empty string) and
/// `key=value` pairs over the policy-permitted values.
fn setconf_pattern(file: &PolicyFile) -> Option<String> {
    let mut items = Vec::new();
    for (key, values) in &file.confs {
        // A null value list permits reading only.
        let Some(values) = values else { continue };
        let key_pat = format!("(?i:{})", regex::escape(key));
        let assignable: Vec<String> = values
            .iter()
            .filter(|v| !v.is_empty())
            .map(|v| regex::escape(v))
            .collect();
        if !assignable.is_empty() {
            items.push(format!("{}=(?:{})", key_pat, assignable.join("|")));
        }
        if values.iter().any(String::is_empty) {
            items.push(key_pat);
        }
    }
    if items.is_empty() {
        return None;
    }
    let alt = items.join("|");
    Some(format!("(?:{alt})(?:\\s+(?:{alt}))*"))
}

/// Compile a pattern anchored over the whole subject string.
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| GraterError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyFile;

    fn ctx() -> PlaceholderContext {
        PlaceholderContext {
            client_address: "127.0.0.1".to_string(),
            client_port: "54321".to_string(),
            server_address: "127.0.0.1".to_string(),
            server_port: "951".to_string(),
        }
    }

    fn compile_yaml(yaml: &str) -> CompiledRules {
        let file: PolicyFile = serde_yaml::from_str(yaml).expect("valid yaml");
        compile(&file).expect("compiles")
    }

    #[test]
    fn test_rules_are_anchored() {
        let rules = compile_yaml("commands:\n  SIGNAL:\n    - 'NEWNYM'\n");
        assert!(rules.lookup("SIGNAL", "NEWNYM").is_some());
        assert!(rules.lookup("SIGNAL", "NEWNYM RELOAD").is_none());
        assert!(rules.lookup("SIGNAL", "RELOAD").is_none());
        assert!(rules.lookup("SIGNAL", "XNEWNYM").is_none());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = compile_yaml(
            "commands:\n  GETINFO:\n    - pattern: '(.*)'\n      replacement: 'first-{0}'\n    - pattern: 'version'\n      replacement: 'second'\n",
        );
        let rule = rules.lookup("GETINFO", "version").expect("matches");
        let rewritten = rule.rewrite_args("version", &ctx()).unwrap();
        assert_eq!(rewritten.as_deref(), Some("first-version"));
    }

    #[test]
    fn test_verb_present_with_no_rules_permits_nothing() {
        let rules = compile_yaml("commands:\n  GETINFO: []\n");
        assert!(rules.allowed_commands.contains_key("GETINFO"));
        assert!(rules.lookup("GETINFO", "").is_none());
        assert!(rules.lookup("GETINFO", "version").is_none());
    }

    #[test]
    fn test_empty_pattern_permits_bare_invocation() {
        let rules = compile_yaml("commands:\n  TAKECONTROL:\n    - ''\n");
        assert!(rules.lookup("TAKECONTROL", "").is_some());
        assert!(rules.lookup("TAKECONTROL", "x").is_none());
    }

    #[test]
    fn test_verbs_and_events_are_uppercased() {
        let rules = compile_yaml("commands:\n  getinfo:\n    - 'version'\nevents:\n  stream: {}\n");
        assert!(rules.lookup("GETINFO", "version").is_some());
        assert!(rules.allowed_events.contains_key("STREAM"));
    }

    #[test]
    fn test_getconf_synthesis_is_case_insensitive() {
        let rules = compile_yaml("confs:\n  MaxCircuitDirtiness: ['']\n  SocksPort:\n");
        assert!(rules.lookup("GETCONF", "maxcircuitdirtiness").is_some());
        assert!(rules.lookup("GETCONF", "SocksPort").is_some());
        assert!(rules.lookup("GETCONF", "DisableNetwork").is_none());
    }

    #[test]
    fn test_setconf_synthesis() {
        let rules = compile_yaml("confs:\n  MaxCircuitDirtiness: ['']\n  SocksPort: ['9050']\n");
        // Reset plus permitted assignment, in one command.
        assert!(rules
            .lookup("SETCONF", "MaxCircuitDirtiness SocksPort=9050")
            .is_some());
        assert!(rules.lookup("SETCONF", "SocksPort=9050").is_some());
        // Value outside the permitted list.
        assert!(rules.lookup("SETCONF", "SocksPort=9999").is_none());
        // SocksPort has no reset entry (no empty string in its list).
        assert!(rules.lookup("SETCONF", "SocksPort").is_none());
    }

    #[test]
    fn test_setconf_omitted_for_read_only_confs() {
        let rules = compile_yaml("confs:\n  SocksPort:\n");
        assert!(rules.lookup("GETCONF", "SocksPort").is_some());
        assert!(!rules.allowed_commands.contains_key("SETCONF"));
    }

    #[test]
    fn test_template_positional_and_named() {
        let template = Template::parse("Port=80,{client-address}:{}").unwrap();
        let pattern = anchored(r"NEW:BEST Port=80,(\d+)").unwrap();
        let caps = pattern.captures("NEW:BEST Port=80,8080").unwrap();
        assert_eq!(
            template.render(&caps, &ctx()).unwrap(),
            "Port=80,127.0.0.1:8080"
        );
    }

    #[test]
    fn test_template_explicit_index_and_braces() {
        let template = Template::parse("{{{1}-{0}}}").unwrap();
        let pattern = anchored(r"(\w+) (\w+)").unwrap();
        let caps = pattern.captures("alpha beta").unwrap();
        assert_eq!(template.render(&caps, &ctx()).unwrap(), "{beta-alpha}");
    }

    #[test]
    fn test_template_out_of_range_group_is_an_error() {
        let template = Template::parse("{2}").unwrap();
        let pattern = anchored(r"(\w+)").unwrap();
        let caps = pattern.captures("alpha").unwrap();
        assert!(template.render(&caps, &ctx()).is_err());
    }

    #[test]
    fn test_template_unknown_placeholder_rejected() {
        assert!(Template::parse("{peer-address}").is_err());
        assert!(Template::parse("{unterminated").is_err());
    }

    #[test]
    fn test_response_rewrite_first_match_wins() {
        let rules = vec![
            ResponseRewrite::compile(&RewriteRuleSpec {
                pattern: "250-address=.*".to_string(),
                replacement: "250-address={client-address}".to_string(),
            })
            .unwrap(),
            ResponseRewrite::compile(&RewriteRuleSpec {
                pattern: "250-address=.*".to_string(),
                replacement: "never reached".to_string(),
            })
            .unwrap(),
        ];
        let lines = vec![
            "250-address=93.184.216.34".to_string(),
            "250 OK".to_string(),
        ];
        let rewritten = rewrite_lines(&lines, &rules, &ctx()).unwrap();
        assert_eq!(rewritten[0], "250-address=127.0.0.1");
        // Non-matching lines pass through verbatim.
        assert_eq!(rewritten[1], "250 OK");
    }

    #[test]
    fn test_pass_through_rule_matches_anything() {
        let rule = CompiledArgRule::pass_through();
        assert!(rule.matches(""));
        assert!(rule.matches("anything at all"));
        assert!(rule.rewrite_args("x", &ctx()).unwrap().is_none());
    }

    #[test]
    fn test_bad_pattern_is_a_compile_error() {
        let file: PolicyFile =
            serde_yaml::from_str("commands:\n  GETINFO:\n    - '(unclosed'\n").unwrap();
        assert!(compile(&file).is_err());
    }
}
