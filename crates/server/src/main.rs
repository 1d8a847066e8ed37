mod bootstrap;
mod chat;
mod health;
mod invoke;
mod platform;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use agenthost_agent::AgentRuntime;
use agenthost_core::config::{
    ConfigOverrides, LoadOptions, LogFormat, LoggingConfig, RuntimeConfig,
};

#[derive(Debug, Parser)]
#[command(name = "agenthost-server", version, about = "Serve an agent app over HTTP")]
struct Args {
    /// Manifest path; defaults to agentapp.yaml, agentapp.yml or agentapp.toml
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    /// Skip platform heartbeats even when configured
    #[arg(long)]
    no_platform: bool,
    #[arg(long)]
    log_level: Option<String>,
    /// compact, pretty or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn load_options(self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config,
            overrides: ConfigOverrides {
                port: self.port,
                disable_platform: self.no_platform,
                log_level: self.log_level,
                log_format: self.log_format,
                ..ConfigOverrides::default()
            },
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    use tracing::Level;
    use LogFormat::*;

    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    // Logging needs the resolved config, so load it before anything else.
    let config = RuntimeConfig::load(args.load_options())?;
    init_logging(&config.logging);

    let runtime = AgentRuntime::with_builtin_providers(chat::factory);
    let app = bootstrap::bootstrap(config, runtime).await?;
    bootstrap::serve(app, wait_for_shutdown()).await?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
