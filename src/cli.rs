//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

/// Promptgate - prompt-injecting reverse proxy for OpenAI-compatible APIs
#[derive(Debug, Parser)]
#[command(
    name = "promptgate",
    about = "Prompt-injecting reverse proxy for OpenAI-compatible chat APIs",
    version,
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Bind address override
    #[arg(long, help = "Bind address (overrides config)")]
    pub host: Option<String>,

    /// Bind port override
    #[arg(short, long, help = "Bind port (overrides config)")]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_defaults() {
        let cli = Cli::parse_from(["promptgate"]);
        assert!(cli.config.is_none());
        assert!(cli.log_level.is_none());
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::parse_from([
            "promptgate",
            "-c",
            "/etc/promptgate.yml",
            "-l",
            "debug",
            "--host",
            "127.0.0.1",
            "-p",
            "9000",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/promptgate.yml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.port, Some(9000));
    }
}
