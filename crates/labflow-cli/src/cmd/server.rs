use anyhow::{Context, Result};
use labflow_core::config::LabConfig;
use std::path::Path;

pub fn run(config_path: &Path, name: &str) -> Result<()> {
    let config = LabConfig::load(config_path)
        .with_context(|| format!("cannot load config from {}", config_path.display()))?;
    super::config::log_warnings(&config);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(labflow_server::serve_action_server(name, config))
}
