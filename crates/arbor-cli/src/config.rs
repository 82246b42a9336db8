use arbor_core::{ArborError, ArborResult};
use arbor_events::BusConfig;
use arbor_orchestrator::{LlmConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Contents of `arbor.toml`. Every table is optional.
///
/// ```toml
/// [bus]
/// buffer_capacity = 1024
/// max_retries = 3
///
/// [orchestrator]
/// max_concurrency = 8
/// cascade_failures = true
///
/// [llm]
/// model = "scripted"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl ArborConfig {
    pub fn from_toml_str(text: &str) -> ArborResult<Self> {
        let config: ArborConfig =
            toml::from_str(text).map_err(|e| ArborError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> ArborResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ArborResult<()> {
        self.bus.validate()?;
        self.orchestrator.validate()
    }
}
