use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "toolgate",
    version,
    about = "MCP gateway that multiplexes downstream MCP servers behind one tool surface"
)]
pub struct Cli {
    /// Project root directory (for .mcp.json discovery).
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Custom MCP config file path.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Policy file path (YAML or JSON).
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Only show errors.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Resolve the effective log level: --debug beats --quiet beats
    /// --log-level (which the MCP_GATEWAY_LOG_LEVEL env var may have
    /// overridden).
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            &self.log_level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["toolgate"]);
        assert!(cli.project.is_none());
        assert!(cli.config.is_none());
        assert!(cli.policy.is_none());
        assert_eq!(cli.effective_log_level(), "info");
    }

    #[test]
    fn test_debug_beats_quiet() {
        let cli = Cli::parse_from(["toolgate", "--debug", "--quiet"]);
        assert_eq!(cli.effective_log_level(), "debug");

        let cli = Cli::parse_from(["toolgate", "--quiet"]);
        assert_eq!(cli.effective_log_level(), "error");
    }

    #[test]
    fn test_paths() {
        let cli = Cli::parse_from([
            "toolgate",
            "--project",
            "/work/repo",
            "--config",
            "/etc/mcp.json",
            "--policy",
            "/etc/policy.yaml",
            "--log-level",
            "warn",
        ]);
        assert_eq!(cli.effective_log_level(), "warn");
        assert_eq!(cli.project.unwrap(), PathBuf::from("/work/repo"));
        assert_eq!(cli.config.unwrap(), PathBuf::from("/etc/mcp.json"));
        assert_eq!(cli.policy.unwrap(), PathBuf::from("/etc/policy.yaml"));
    }
}
