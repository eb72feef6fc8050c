//! Promptgate server entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use promptgate::cli::Cli;
use promptgate::config::Config;
use promptgate::prepare::MessagePreparer;
use promptgate::server::{self, AppState};
use promptgate::template::TemplateStore;
use promptgate::upstream::UpstreamClient;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level_str = cli_log_level.or(config_log_level);
    let level = if let Some(s) = level_str {
        match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        }
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Read just the log-level from the config fallback chain, before logging
/// is initialized
fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
    Config::load(config_path).ok().and_then(|config| config.log_level)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        debug!(%host, "main: overriding host from CLI");
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        debug!(port, "main: overriding port from CLI");
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        with_input = %config.proxy.template_with_input.display(),
        without_input = %config.proxy.template_without_input.display(),
        fake_streaming = config.proxy.fake_streaming.enabled,
        "promptgate configured"
    );

    let store = Arc::new(TemplateStore::new());
    // Warm the cache so template problems surface at startup rather than on
    // the first request
    store.ensure_loaded(&config.proxy.template_with_input);
    store.ensure_loaded(&config.proxy.template_without_input);

    let preparer = Arc::new(MessagePreparer::new(
        Arc::clone(&store),
        config.proxy.template_with_input.clone(),
        config.proxy.template_without_input.clone(),
    ));
    let upstream = UpstreamClient::new(&config).map_err(|e| eyre::eyre!("Failed to build HTTP client: {e}"))?;

    let config = Arc::new(config);
    let state = AppState {
        config: Arc::clone(&config),
        preparer,
        upstream,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind {addr}"))?;
    info!("promptgate listening on {addr}");

    axum::serve(listener, server::router(state))
        .await
        .context("Server error")?;

    Ok(())
}
