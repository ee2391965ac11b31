use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Where a server config was discovered. Precedence on name collision:
/// project beats user beats custom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Project,
    User,
    Custom,
}

impl ConfigSource {
    /// Lower rank wins.
    fn rank(self) -> u8 {
        match self {
            ConfigSource::Project => 0,
            ConfigSource::User => 1,
            ConfigSource::Custom => 2,
        }
    }
}

/// One downstream server as written in an `.mcp.json` document.
///
/// `command` stays optional at parse time so a single bad record fails its
/// own connect instead of the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment passed to the child, merged over the gateway's own
    /// environment. Config wins on collision.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// A server config tagged with its name and origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedServerConfig {
    pub name: String,
    pub source: ConfigSource,
    pub config: ServerConfig,
}

/// Shape of an `.mcp.json` document.
#[derive(Debug, Deserialize)]
struct McpConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerConfig>,
}

/// Discover and merge server configs.
///
/// Sources, in precedence order:
///   1. `.mcp.json` under the project root (or cwd)
///   2. `~/.mcp.json`, then `~/.claude/.mcp.json`
///   3. an explicit custom config path
///
/// Within the same rank the first file that names a server wins.
pub fn load_configs(
    project_root: Option<&Path>,
    custom_config_path: Option<&Path>,
) -> Result<Vec<ResolvedServerConfig>> {
    let mut candidates: Vec<(PathBuf, ConfigSource)> = Vec::new();

    let project = project_root
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok());
    if let Some(root) = project {
        candidates.push((root.join(".mcp.json"), ConfigSource::Project));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push((home.join(".mcp.json"), ConfigSource::User));
        candidates.push((home.join(".claude").join(".mcp.json"), ConfigSource::User));
    }
    if let Some(custom) = custom_config_path {
        candidates.push((custom.to_path_buf(), ConfigSource::Custom));
    }

    let mut merged: HashMap<String, ResolvedServerConfig> = HashMap::new();

    for (path, source) in candidates {
        if !path.is_file() {
            continue;
        }
        for resolved in load_config_file(&path, source)? {
            match merged.get(&resolved.name) {
                Some(existing) if existing.source.rank() <= resolved.source.rank() => {}
                _ => {
                    merged.insert(resolved.name.clone(), resolved);
                }
            }
        }
    }

    let mut configs: Vec<ResolvedServerConfig> = merged.into_values().collect();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}

/// Parse one config file: read, expand `${VAR}` references from the process
/// environment, deserialize.
pub fn load_config_file(path: &Path, source: ConfigSource) -> Result<Vec<ResolvedServerConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let expanded = shellexpand::env(&raw)
        .map_err(|e| anyhow::anyhow!("env var interpolation failed in {}: {e}", path.display()))?;

    let parsed: McpConfigFile = serde_json::from_str(&expanded)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed
        .mcp_servers
        .into_iter()
        .map(|(name, config)| ResolvedServerConfig {
            name,
            source,
            config,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            ".mcp.json",
            r#"{
                "mcpServers": {
                    "github": {"command": "npx", "args": ["-y", "@modelcontextprotocol/server-github"]},
                    "fs": {"command": "mcp-fs", "env": {"ROOT": "/tmp"}, "cwd": "/tmp"}
                }
            }"#,
        );

        let mut configs = load_config_file(&path, ConfigSource::Project).unwrap();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "fs");
        assert_eq!(configs[0].config.env.get("ROOT").unwrap(), "/tmp");
        assert_eq!(configs[1].config.command.as_deref(), Some("npx"));
        assert_eq!(configs[1].config.args.len(), 2);
    }

    #[test]
    fn test_missing_command_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            ".mcp.json",
            r#"{"mcpServers": {"broken": {"args": ["x"]}}}"#,
        );

        let configs = load_config_file(&path, ConfigSource::User).unwrap();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].config.command.is_none());
    }

    #[test]
    fn test_env_var_expansion() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-local env var, no concurrent env reads in this test
        unsafe { std::env::set_var("TOOLGATE_TEST_BIN", "/opt/bin/server") };
        let path = write_config(
            dir.path(),
            ".mcp.json",
            r#"{"mcpServers": {"srv": {"command": "${TOOLGATE_TEST_BIN}"}}}"#,
        );

        let configs = load_config_file(&path, ConfigSource::Custom).unwrap();
        assert_eq!(configs[0].config.command.as_deref(), Some("/opt/bin/server"));
    }

    #[test]
    fn test_project_beats_custom_on_collision() {
        let home = tempfile::tempdir().unwrap();
        // SAFETY: discovery tests all point HOME at an empty tempdir, so the
        // real user config cannot leak in and interleaving is harmless
        unsafe { std::env::set_var("HOME", home.path()) };
        let project_dir = tempfile::tempdir().unwrap();
        let custom_dir = tempfile::tempdir().unwrap();
        write_config(
            project_dir.path(),
            ".mcp.json",
            r#"{"mcpServers": {"dup": {"command": "project-bin"}, "only-project": {"command": "p"}}}"#,
        );
        let custom = write_config(
            custom_dir.path(),
            "extra.json",
            r#"{"mcpServers": {"dup": {"command": "custom-bin"}, "only-custom": {"command": "c"}}}"#,
        );

        let configs = load_configs(Some(project_dir.path()), Some(&custom)).unwrap();
        let by_name: HashMap<&str, &ResolvedServerConfig> =
            configs.iter().map(|c| (c.name.as_str(), c)).collect();

        assert_eq!(by_name["dup"].config.command.as_deref(), Some("project-bin"));
        assert_eq!(by_name["dup"].source, ConfigSource::Project);
        assert!(by_name.contains_key("only-project"));
        assert!(by_name.contains_key("only-custom"));
    }

    #[test]
    fn test_load_configs_sorted_and_missing_files_skipped() {
        let home = tempfile::tempdir().unwrap();
        // SAFETY: see test_project_beats_custom_on_collision
        unsafe { std::env::set_var("HOME", home.path()) };
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            ".mcp.json",
            r#"{"mcpServers": {"zeta": {"command": "z"}, "alpha": {"command": "a"}}}"#,
        );

        let missing = dir.path().join("does-not-exist.json");
        let configs = load_configs(Some(dir.path()), Some(&missing)).unwrap();
        let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
