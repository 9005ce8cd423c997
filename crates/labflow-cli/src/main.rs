mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, ctl::CtlSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "labflow",
    about = "Run an orchestrator and its action servers, and drive them from the shell",
    version,
    propagate_version = true
)]
struct Cli {
    /// Lab config file
    #[arg(long, short = 'c', global = true, env = "LABFLOW_CONFIG", default_value = "labflow.yml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator
    Orchestrator,

    /// Run one action server from the config
    Server {
        /// Server name as listed under `servers:`
        name: String,
    },

    /// Create, show and validate the lab config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Control a running orchestrator
    Ctl {
        /// Orchestrator base URL (default: taken from the config)
        #[arg(long, env = "LABFLOW_URL")]
        url: Option<String>,

        #[command(subcommand)]
        subcommand: CtlSubcommand,
    },
}

fn orchestrator_url(config: &std::path::Path, url: Option<String>) -> anyhow::Result<String> {
    match url {
        Some(url) => Ok(url),
        None => {
            let config = labflow_core::config::LabConfig::load(config)
                .map_err(|e| anyhow::anyhow!("{e} (pass --url or create {})", config.display()))?;
            Ok(config.orchestrator_url())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Orchestrator | Commands::Server { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Orchestrator => cmd::orchestrator::run(&cli.config),
        Commands::Server { name } => cmd::server::run(&cli.config, &name),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Ctl { url, subcommand } => orchestrator_url(&cli.config, url)
            .and_then(|base| cmd::ctl::run(&base, subcommand, cli.json)),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
