use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default ceilings applied when the policy file omits `limits`.
fn default_max_tools_per_server() -> usize {
    100
}
fn default_max_output_bytes() -> usize {
    50_000
}
fn default_max_output_tokens() -> usize {
    4_000
}
fn default_true() -> bool {
    true
}

/// Replacement text for every redaction match.
const REDACTED: &str = "[REDACTED]";

/// Built-in redaction patterns, always compiled when the file lists none.
const DEFAULT_REDACTION_PATTERNS: &[&str] = &[
    r"(?i)(api[_-]?key|token|password|secret)\s*[:=]\s*\S+",
    r"Bearer\s+\S+",
    r"sk-[A-Za-z0-9]{8,}",
];

/// Allow/deny lists for one namespace (servers or tools).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRules {
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

/// Output and indexing ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_tools_per_server")]
    pub max_tools_per_server: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Informational only; not enforced by the gateway.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tools_per_server: default_max_tools_per_server(),
            max_output_bytes: default_max_output_bytes(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Secret redaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra regex patterns, applied on top of the built-in set.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

/// On-disk policy document (JSON or YAML, all sections optional).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub servers: ListRules,
    #[serde(default)]
    pub tools: ListRules,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

/// Post-processed tool output: possibly redacted and truncated.
#[derive(Debug, Clone)]
pub struct ProcessedOutput {
    pub result: Value,
    pub truncated: bool,
    pub summary: Option<String>,
    pub raw_size: usize,
}

/// Compiled policy: pure predicates over server/tool names plus output
/// post-processing. Built once at startup, shared read-only afterwards.
pub struct PolicyManager {
    limits: Limits,
    redaction_enabled: bool,
    /// Server allowlist entries are literal names.
    server_allow: Option<HashSet<String>>,
    /// Server denylist entries are globs.
    server_deny: GlobSet,
    /// Tool lists are globs over `server::tool`.
    tool_allow: Option<GlobSet>,
    tool_deny: GlobSet,
    redactors: Vec<Regex>,
}

impl PolicyManager {
    /// Build from an in-memory config (used for the no-policy-file default).
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        let server_allow = config
            .servers
            .allowlist
            .map(|names| names.into_iter().collect());
        let server_deny = build_glob_set(&config.servers.denylist)
            .context("invalid glob in servers.denylist")?;
        let tool_allow = config
            .tools
            .allowlist
            .as_deref()
            .map(build_glob_set)
            .transpose()
            .context("invalid glob in tools.allowlist")?;
        let tool_deny =
            build_glob_set(&config.tools.denylist).context("invalid glob in tools.denylist")?;

        let mut redactors = Vec::new();
        for pattern in DEFAULT_REDACTION_PATTERNS {
            redactors.push(Regex::new(pattern).expect("built-in redaction pattern compiles"));
        }
        for pattern in &config.redaction.patterns {
            redactors.push(
                Regex::new(pattern)
                    .with_context(|| format!("invalid redaction pattern: {pattern}"))?,
            );
        }

        Ok(Self {
            limits: config.limits,
            redaction_enabled: config.redaction.enabled,
            server_allow,
            server_deny,
            tool_allow,
            tool_deny,
            redactors,
        })
    }

    /// Load a policy file, dispatching on extension: `.yaml`/`.yml` parse as
    /// YAML, everything else as JSON with a YAML fallback.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file: {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config: PolicyConfig = if is_yaml {
            serde_yaml_ng::from_str(&raw)
                .with_context(|| format!("failed to parse policy file: {}", path.display()))?
        } else {
            match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(_) => serde_yaml_ng::from_str(&raw)
                    .with_context(|| format!("failed to parse policy file: {}", path.display()))?,
            }
        };

        Self::from_config(config)
    }

    pub fn max_tools_per_server(&self) -> usize {
        self.limits.max_tools_per_server
    }

    #[allow(dead_code)]
    pub fn max_output_bytes(&self) -> usize {
        self.limits.max_output_bytes
    }

    /// A server is allowed iff it is on the allowlist (or none is configured)
    /// and matches no denylist entry.
    pub fn is_server_allowed(&self, name: &str) -> bool {
        if let Some(allow) = &self.server_allow
            && !allow.contains(name)
        {
            return false;
        }
        !self.server_deny.is_match(name)
    }

    /// Same rule for tools, with glob matching on both lists.
    pub fn is_tool_allowed(&self, tool_id: &str) -> bool {
        if let Some(allow) = &self.tool_allow
            && !allow.is_match(tool_id)
        {
            return false;
        }
        !self.tool_deny.is_match(tool_id)
    }

    /// Replace every secret-pattern match with `[REDACTED]`.
    pub fn redact_secrets(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.redactors {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
        out
    }

    /// Truncate `text` to at most `max_bytes`, appending a visible marker.
    ///
    /// Returns (body, truncated, original_size). The body never exceeds
    /// `max_bytes`; the kept prefix is clamped to a char boundary and shrunk
    /// until prefix + marker fit.
    pub fn truncate_output(&self, text: &str, max_bytes: usize) -> (String, bool, usize) {
        let total = text.len();
        if total <= max_bytes {
            return (text.to_string(), false, total);
        }

        let marker_for = |kept: usize| format!("[... OUTPUT TRUNCATED: {kept} bytes of {total} ...]");

        let mut kept = max_bytes.saturating_sub(marker_for(max_bytes).len());
        loop {
            while kept > 0 && !text.is_char_boundary(kept) {
                kept -= 1;
            }
            let marker = marker_for(kept);
            if kept + marker.len() <= max_bytes {
                return (format!("{}{marker}", &text[..kept]), true, total);
            }
            if kept == 0 {
                // max_bytes smaller than the marker itself; the marker is
                // ASCII so a byte cut is safe
                let mut marker = marker;
                marker.truncate(max_bytes);
                return (marker, true, total);
            }
            kept = kept.saturating_sub(kept + marker.len() - max_bytes);
        }
    }

    /// Full output pipeline: serialize, redact (if requested), truncate.
    ///
    /// An untouched result is passed through as its original JSON value;
    /// redacted or truncated output degrades to a string body.
    pub fn process_output(
        &self,
        result: &Value,
        redact: bool,
        max_bytes: Option<usize>,
    ) -> ProcessedOutput {
        let serialized = match result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };

        let redact = redact && self.redaction_enabled;
        let redacted = if redact {
            self.redact_secrets(&serialized)
        } else {
            serialized
        };

        let max = max_bytes.unwrap_or(self.limits.max_output_bytes);
        let (body, truncated, raw_size) = self.truncate_output(&redacted, max);

        if !truncated && !redact {
            return ProcessedOutput {
                result: result.clone(),
                truncated: false,
                summary: None,
                raw_size,
            };
        }

        let summary = truncated
            .then(|| format!("Output truncated: kept {} of {} bytes", body.len(), raw_size));

        ProcessedOutput {
            result: Value::String(body),
            truncated,
            summary,
            raw_size,
        }
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::from_config(PolicyConfig::default()).expect("default policy compiles")
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy_from_json(doc: Value) -> PolicyManager {
        let config: PolicyConfig = serde_json::from_value(doc).unwrap();
        PolicyManager::from_config(config).unwrap()
    }

    #[test]
    fn test_allows_all_by_default() {
        let policy = PolicyManager::default();
        assert!(policy.is_server_allowed("any-server"));
        assert!(policy.is_server_allowed("another-server"));
        assert!(policy.is_tool_allowed("github::create_issue"));
    }

    #[test]
    fn test_denies_servers_on_denylist() {
        let policy = policy_from_json(json!({
            "servers": {"denylist": ["blocked-*", "dangerous"]}
        }));
        assert!(!policy.is_server_allowed("blocked-server"));
        assert!(!policy.is_server_allowed("blocked-anything"));
        assert!(!policy.is_server_allowed("dangerous"));
        assert!(policy.is_server_allowed("allowed-server"));
    }

    #[test]
    fn test_only_allows_servers_on_allowlist() {
        let policy = policy_from_json(json!({
            "servers": {"allowlist": ["github", "jira"]}
        }));
        assert!(policy.is_server_allowed("github"));
        assert!(policy.is_server_allowed("jira"));
        assert!(!policy.is_server_allowed("slack"));
    }

    #[test]
    fn test_tool_glob_patterns() {
        let policy = policy_from_json(json!({
            "tools": {"denylist": ["*::delete_*", "dangerous::*"]}
        }));
        assert!(!policy.is_tool_allowed("github::delete_repo"));
        assert!(!policy.is_tool_allowed("jira::delete_issue"));
        assert!(!policy.is_tool_allowed("dangerous::anything"));
        assert!(policy.is_tool_allowed("github::create_issue"));
    }

    #[test]
    fn test_tool_allowlist_restricts() {
        let policy = policy_from_json(json!({
            "tools": {"allowlist": ["github::*"], "denylist": ["github::delete_*"]}
        }));
        assert!(policy.is_tool_allowed("github::create_issue"));
        assert!(!policy.is_tool_allowed("jira::create_issue"));
        // Denylist still wins inside the allowlist
        assert!(!policy.is_tool_allowed("github::delete_repo"));
    }

    #[test]
    fn test_does_not_truncate_small_outputs() {
        let policy = PolicyManager::default();
        let (result, truncated, original_size) = policy.truncate_output("short output", 50_000);
        assert_eq!(result, "short output");
        assert!(!truncated);
        assert_eq!(original_size, 12);
    }

    #[test]
    fn test_truncates_large_outputs() {
        let policy = PolicyManager::default();
        let large = "x".repeat(100_000);
        let (result, truncated, original_size) = policy.truncate_output(&large, 1_000);

        assert!(result.len() <= 1_000);
        assert!(truncated);
        assert_eq!(original_size, 100_000);
        assert!(result.contains("[... OUTPUT TRUNCATED"));
        assert!(result.contains("of 100000"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let policy = PolicyManager::default();
        // 4-byte scorpions; a naive byte cut would split one
        let large = "\u{1F982}".repeat(1_000);
        let (result, truncated, _) = policy.truncate_output(&large, 200);
        assert!(truncated);
        assert!(result.len() <= 200);
        // Body must still be valid UTF-8 with the marker intact
        assert!(result.ends_with("...]"));
    }

    #[test]
    fn test_truncation_tiny_budget() {
        let policy = PolicyManager::default();
        let (result, truncated, _) = policy.truncate_output(&"y".repeat(500), 10);
        assert!(truncated);
        assert!(result.len() <= 10);
    }

    #[test]
    fn test_redacts_common_patterns() {
        let policy = PolicyManager::default();
        let input = "\
            API_KEY=sk-1234567890\n\
            password: mysecretpassword\n\
            Bearer eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9\n";

        let redacted = policy.redact_secrets(input);
        assert!(!redacted.contains("sk-1234567890"));
        assert!(!redacted.contains("mysecretpassword"));
        assert!(!redacted.contains("eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9"));
        assert!(redacted.contains(REDACTED));
    }

    #[test]
    fn test_process_output_passthrough() {
        let policy = PolicyManager::default();
        let result = json!({"rows": [1, 2, 3]});
        let processed = policy.process_output(&result, false, None);
        assert_eq!(processed.result, result);
        assert!(!processed.truncated);
        assert!(processed.summary.is_none());
    }

    #[test]
    fn test_process_output_redact_and_truncate() {
        let policy = PolicyManager::default();
        let body = format!("token=abc123xyz {}", "z".repeat(2_000));
        let processed = policy.process_output(&Value::String(body), true, Some(500));

        assert!(processed.truncated);
        assert!(processed.raw_size > 500);
        let text = processed.result.as_str().unwrap();
        assert!(!text.contains("abc123xyz"));
        assert!(text.len() <= 500);
        assert!(processed.summary.is_some());
    }

    #[test]
    fn test_loads_yaml_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            "servers:\n  denylist:\n    - blocked-server\nlimits:\n  max_output_bytes: 10000\n",
        )
        .unwrap();

        let policy = PolicyManager::load(&path).unwrap();
        assert!(!policy.is_server_allowed("blocked-server"));
        assert_eq!(policy.max_output_bytes(), 10_000);
        assert_eq!(policy.max_tools_per_server(), 100);
    }

    #[test]
    fn test_loads_json_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"tools": {"denylist": ["*::drop_*"]}, "limits": {"max_tools_per_server": 5}}"#,
        )
        .unwrap();

        let policy = PolicyManager::load(&path).unwrap();
        assert!(!policy.is_tool_allowed("db::drop_table"));
        assert_eq!(policy.max_tools_per_server(), 5);
    }
}
