//! Layered configuration for the Outdial engine.
//!
//! Settings are read from `outdial.toml` in the working directory, then
//! overridden by `OUTDIAL_*` environment variables, then by CLI flags.
//!
//! # Configuration file format
//!
//! ```toml
//! [server]
//! port = 3100
//! db_path = "outdial.db"
//!
//! [engine]
//! retry_limit = 2
//! retry_backoff_ms = 500
//! scheduler_interval_secs = 10
//!
//! [placement]
//! base_url = "http://localhost:8080"
//! request_timeout_secs = 30
//! simulated = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "outdial.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub db_path: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 3100,
            db_path: PathBuf::from("outdial.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Extra placement attempts after a transient failure before the job is
    /// marked failed. The first attempt is not counted.
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    /// How often the server checks for scheduled campaigns whose start time
    /// has passed.
    pub scheduler_interval_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            retry_backoff_ms: 500,
            scheduler_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Use the simulated provider instead of the HTTP gateway. Dev mode
    /// forces this on.
    pub simulated: bool,
}

impl Default for PlacementSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            simulated: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub engine: EngineSection,
    pub placement: PlacementSection,
}

impl Config {
    /// Load configuration from `dir/outdial.toml` (missing file means all
    /// defaults), then apply environment overrides.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides, one variable per scalar setting.
    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("OUTDIAL_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(db_path) = std::env::var("OUTDIAL_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Ok(limit) = std::env::var("OUTDIAL_RETRY_LIMIT")
            && let Ok(limit) = limit.parse()
        {
            self.engine.retry_limit = limit;
        }
        if let Ok(backoff) = std::env::var("OUTDIAL_RETRY_BACKOFF_MS")
            && let Ok(backoff) = backoff.parse()
        {
            self.engine.retry_backoff_ms = backoff;
        }
        if let Ok(base_url) = std::env::var("OUTDIAL_PLACEMENT_URL") {
            self.placement.base_url = base_url;
        }
        if let Ok(api_key) = std::env::var("OUTDIAL_PLACEMENT_API_KEY") {
            self.placement.api_key = Some(api_key);
        }
    }
}

/// The retry knobs handed to each dispatcher, extracted so the engine does
/// not depend on the full config object.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub backoff_ms: u64,
}

impl From<&EngineSection> for RetryPolicy {
    fn from(section: &EngineSection) -> Self {
        Self {
            limit: section.retry_limit,
            backoff_ms: section.retry_backoff_ms,
        }
    }
}
