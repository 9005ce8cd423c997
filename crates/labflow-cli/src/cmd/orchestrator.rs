use anyhow::{Context, Result};
use labflow_core::config::LabConfig;
use labflow_core::plan::PlanLibrary;
use std::path::Path;

pub fn run(config_path: &Path) -> Result<()> {
    let config = LabConfig::load(config_path)
        .with_context(|| format!("cannot load config from {}", config_path.display()))?;
    super::config::log_warnings(&config);

    let plans = PlanLibrary::with_builtins();
    tracing::info!(plans = ?plans.names(), servers = config.servers.len(), "starting orchestrator");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(labflow_server::serve_orchestrator(config, plans))
}
