use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::{EngineConfig, FilterConfig, FlowEngine, IpMap};
use crate::flow::FlowConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub filter: FilterConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowrecon/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowrecon/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("flowrecon.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Build an engine from these settings, loading the IP map if one is set
    pub fn build_engine(&self) -> Result<FlowEngine> {
        let engine = FlowEngine::new(self.flow.clone(), self.engine.clone(), self.filter.clone());
        match &self.filter.ip_map {
            Some(path) => Ok(engine.with_ip_map(IpMap::load(path)?)),
            None => Ok(engine),
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.engine.batch_size > 0, "engine.batch_size must be at least 1");
        ensure!(self.engine.chunk_size > 0, "engine.chunk_size must be at least 1");
        ensure!(self.engine.channel_depth > 0, "engine.channel_depth must be at least 1");
        ensure!(self.engine.flush_interval_ms > 0, "engine.flush_interval_ms must be at least 1");
        ensure!(
            self.flow.flow_timeout_seconds > 0,
            "flow.flow_timeout_seconds must be at least 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
