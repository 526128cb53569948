//! Configuration handling for the stream management simulator.
//!
//! This module reads the shared YAML config file and `SM_*` environment
//! variables and turns them into an [`SmConfig`] plus the simulator's own
//! settings.

use anyhow::{bail, Result};
use serde::Deserialize;
use sm_session::SmConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Where resumable sessions are kept between runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// Lost when the process exits
    Memory,
    /// JSON files under a directory
    File {
        /// Directory holding one file per entity
        dir: PathBuf,
    },
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Stream entity, used as the resume store key
    pub entity: String,
    /// Request resumption when enabling
    pub resume: bool,
    /// Send `<r/>` after every Nth stanza
    pub request_every: u32,
    /// Upper bound on the pending set
    pub max_pending: usize,
    /// Wait for `<enabled/>`/`<resumed/>`
    pub response_timeout: Duration,
    /// Resume store backend
    pub store: StoreMode,
}

impl Default for SimConfig {
    fn default() -> Self {
        let sm = SmConfig::default();
        Self {
            entity: "user@example.com/sim".to_string(),
            resume: sm.resume,
            request_every: sm.request_every,
            max_pending: sm.max_pending,
            response_timeout: sm.response_timeout,
            store: StoreMode::Memory,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    sm: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl SimConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides()?;

        info!(
            "Final sm configuration: entity={}, resume={}, request_every={}, timeout={:?}, store={:?}",
            config.entity, config.resume, config.request_every, config.response_timeout, config.store
        );

        Ok(config)
    }

    /// Library configuration for the session
    pub fn sm_config(&self) -> SmConfig {
        SmConfig {
            resume: self.resume,
            request_every: self.request_every,
            max_pending: self.max_pending,
            response_timeout: self.response_timeout,
        }
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(service) = root_config.services.and_then(|s| s.sm) {
            self.apply_service_config(service)?;
        }
        Ok(())
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) -> Result<()> {
        if let Some(args) = service_config.args {
            for arg in args {
                if let Some(entity) = arg.strip_prefix("--entity=") {
                    self.entity = entity.to_string();
                } else if let Some(dir) = arg.strip_prefix("--store-dir=") {
                    self.store = StoreMode::File { dir: PathBuf::from(dir) };
                }
            }
        }

        if let Some(config_map) = service_config.config {
            // Store mode before store_dir, whatever order the map yields
            if let Some(mode) = config_map.get("services.sm.store") {
                self.set("store", mode)?;
            }
            for (key, value) in &config_map {
                match key.strip_prefix("services.sm.") {
                    Some("store") => {}
                    Some(name) => self.set(name, value)?,
                    None => {}
                }
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, name) in [
            ("SM_ENTITY", "entity"),
            ("SM_RESUME", "resume"),
            ("SM_REQUEST_EVERY", "request_every"),
            ("SM_MAX_PENDING", "max_pending"),
            ("SM_RESPONSE_TIMEOUT", "response_timeout"),
            ("SM_STORE", "store"),
            ("SM_STORE_DIR", "store_dir"),
        ] {
            if let Some(value) = lookup(var) {
                self.set(name, &value)?;
                info!("{} overridden by environment: {}", name, value);
            }
        }
        Ok(())
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "entity" => self.entity = value.to_string(),
            "resume" => self.resume = value.eq_ignore_ascii_case("true") || value == "1",
            "request_every" => self.request_every = value.parse()?,
            "max_pending" => self.max_pending = value.parse()?,
            "response_timeout" => self.response_timeout = humantime::parse_duration(value)?,
            "store" => {
                self.store = match value {
                    "memory" => StoreMode::Memory,
                    "file" => StoreMode::File {
                        dir: self.store_dir().unwrap_or_else(|| PathBuf::from("./smdata")),
                    },
                    other => bail!("Invalid store mode: {}. Use 'memory' or 'file'", other),
                }
            }
            "store_dir" => {
                self.store = StoreMode::File {
                    dir: PathBuf::from(value),
                }
            }
            _ => warn!("Ignoring unknown sm setting {}", name),
        }
        Ok(())
    }

    fn store_dir(&self) -> Option<PathBuf> {
        match &self.store {
            StoreMode::File { dir } => Some(dir.clone()),
            StoreMode::Memory => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SimConfig::default();
        assert_eq!(config.entity, "user@example.com/sim");
        assert!(config.resume);
        assert_eq!(config.request_every, 1);
        assert_eq!(config.store, StoreMode::Memory);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  sm:
    enabled: true
    executable: ./sm-sim
    args:
      - --entity=alice@example.com/phone
    config:
      services.sm.request_every: "5"
      services.sm.response_timeout: "2s 500ms"
      services.sm.resume: "false"
      services.sm.store: "file"
      services.sm.store_dir: "/tmp/sm-sessions"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = SimConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.entity, "alice@example.com/phone");
        assert_eq!(config.request_every, 5);
        assert_eq!(config.response_timeout, Duration::from_millis(2500));
        assert!(!config.resume);
        assert_eq!(
            config.store,
            StoreMode::File {
                dir: PathBuf::from("/tmp/sm-sessions")
            }
        );

        let sm = config.sm_config();
        assert_eq!(sm.request_every, 5);
        assert!(!sm.resume);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.max_pending, SmConfig::default().max_pending);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SM_ENTITY", "bob@example.com/laptop"),
            ("SM_REQUEST_EVERY", "3"),
            ("SM_STORE_DIR", "/var/lib/sm"),
        ]
        .into_iter()
        .collect();

        let mut config = SimConfig::default();
        config
            .apply_overrides_from(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.entity, "bob@example.com/laptop");
        assert_eq!(config.request_every, 3);
        assert_eq!(
            config.store,
            StoreMode::File {
                dir: PathBuf::from("/var/lib/sm")
            }
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let mut config = SimConfig::default();
        assert!(config.set("store", "redis").is_err());
        assert!(config.set("request_every", "often").is_err());
        assert!(config.set("response_timeout", "soon").is_err());
    }
}
