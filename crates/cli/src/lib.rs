pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use agenthost_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "agenthost",
    about = "Agenthost operator CLI",
    long_about = "Inspect the effective agent app configuration and check runtime readiness.",
    after_help = "Examples:\n  agenthost config\n  agenthost --config agentapp.yaml doctor --json"
)]
pub struct Cli {
    /// Manifest path; defaults to agentapp.yaml, agentapp.yml or agentapp.toml
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Print the effective configuration with secrets redacted")]
    Config,
    #[command(about = "Validate config, model providers, session storage and tool servers")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            ..LoadOptions::default()
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let result = match cli.command {
        Command::Config => commands::config::run(options),
        Command::Doctor { json } => commands::doctor::run(options, json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
