use crate::error::{OrchError, Result};
use crate::io::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_orchestrator_port")]
    pub port: u16,
}

fn default_orchestrator_name() -> String {
    "orch".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_orchestrator_port() -> u16 {
    8001
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: default_orchestrator_name(),
            host: default_host(),
            port: default_orchestrator_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Address book entry for one action server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Driver set the server runs. Only `sim` ships with labflow.
    #[serde(default)]
    pub driver: Option<String>,
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// LabConfig
// ---------------------------------------------------------------------------

/// Deployment configuration shared by the orchestrator and every action
/// server. Loaded from a YAML file; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_machine")]
    pub machine: String,
    #[serde(default = "default_access")]
    pub access: String,
    #[serde(default = "default_push_retry_limit")]
    pub push_retry_limit: u32,
    #[serde(default = "default_push_retry_delay_ms")]
    pub push_retry_delay_ms: u64,
    #[serde(default = "default_finish_grace_ms")]
    pub finish_grace_ms: u64,
    /// Absent means a start-condition wait may block forever.
    #[serde(default)]
    pub start_condition_timeout_secs: Option<u64>,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_machine() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_access() -> String {
    "hte".to_string()
}

fn default_push_retry_limit() -> u32 {
    5
}

fn default_push_retry_delay_ms() -> u64 {
    200
}

fn default_finish_grace_ms() -> u64 {
    500
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            servers: BTreeMap::new(),
            data_root: default_data_root(),
            machine: default_machine(),
            access: default_access(),
            push_retry_limit: default_push_retry_limit(),
            push_retry_delay_ms: default_push_retry_delay_ms(),
            finish_grace_ms: default_finish_grace_ms(),
            start_condition_timeout_secs: None,
        }
    }
}

impl LabConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let config: LabConfig = serde_yaml::from_str(data)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        atomic_write(path, data.as_bytes())
    }

    /// Base URL of a configured action server.
    pub fn server_url(&self, name: &str) -> Result<String> {
        self.servers
            .get(name)
            .map(ServerConfig::base_url)
            .ok_or_else(|| OrchError::Validation(format!("server '{name}' is not configured")))
    }

    pub fn orchestrator_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.orchestrator.host, self.orchestrator.port
        )
    }

    pub fn server_urls(&self) -> BTreeMap<String, String> {
        self.servers
            .iter()
            .map(|(name, s)| (name.clone(), s.base_url()))
            .collect()
    }

    pub fn push_retry_delay(&self) -> Duration {
        Duration::from_millis(self.push_retry_delay_ms)
    }

    pub fn finish_grace(&self) -> Duration {
        Duration::from_millis(self.finish_grace_ms)
    }

    pub fn start_condition_timeout(&self) -> Option<Duration> {
        self.start_condition_timeout_secs.map(Duration::from_secs)
    }

    /// Check the configuration for problems that would only show up at runtime.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.servers.contains_key(&self.orchestrator.name) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "orchestrator name '{}' is also used by an action server",
                    self.orchestrator.name
                ),
            });
        }

        let mut seen: HashMap<(String, u16), &str> = HashMap::new();
        seen.insert(
            (self.orchestrator.host.clone(), self.orchestrator.port),
            &self.orchestrator.name,
        );
        for (name, server) in &self.servers {
            if let Some(other) = seen.insert((server.host.clone(), server.port), name) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "'{name}' and '{other}' both bind {}:{}",
                        server.host, server.port
                    ),
                });
            }
        }

        if self.push_retry_limit == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "push_retry_limit is 0: status pushes will never be sent".to_string(),
            });
        }

        if self.servers.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no action servers configured".to_string(),
            });
        }

        warnings
    }
}
