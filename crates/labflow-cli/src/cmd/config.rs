use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use labflow_core::config::{LabConfig, ServerConfig, WarnLevel};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config with one simulated server
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List the orchestrator and servers with their addresses
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init { force } => init(path, force),
        ConfigSubcommand::Show => show(path, json),
        ConfigSubcommand::Validate => validate(path, json),
    }
}

/// Surface config problems in the log of a long-running process.
pub fn log_warnings(config: &LabConfig) {
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite)",
            path.display()
        );
    }
    let mut config = LabConfig::default();
    config.servers.insert(
        "sim".to_string(),
        ServerConfig {
            host: config.orchestrator.host.clone(),
            port: config.orchestrator.port + 9,
            driver: Some("sim".to_string()),
        },
    );
    config.save(path).context("failed to write config")?;
    println!("Wrote {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = LabConfig::load(path).context("failed to load config")?;
    if json {
        return print_json(&config);
    }

    let mut rows = vec![vec![
        config.orchestrator.name.clone(),
        "orchestrator".to_string(),
        config.orchestrator_url(),
    ]];
    for (name, server) in &config.servers {
        rows.push(vec![
            name.clone(),
            server.driver.clone().unwrap_or_else(|| "sim".to_string()),
            server.base_url(),
        ]);
    }
    print_table(&["NAME", "ROLE", "URL"], rows);
    println!("\ndata_root: {}", config.data_root.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = LabConfig::load(path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
