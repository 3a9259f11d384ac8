//! Configuration Loader
//!
//! Layers built-in defaults, an optional configuration file and environment
//! overrides through the `config` crate, then validates the result.

use super::error::{ConfigResult, ConfigurationError};
use super::DlstbxConfig;
use crate::constants::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: DlstbxConfig,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `DLSTBX_CONFIG` (if set) and the environment
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let path = std::env::var(env::CONFIG_FILE).ok().map(PathBuf::from);
        Self::load_from_file(path.as_deref())
    }

    /// Load configuration with an explicit file taking the place of `DLSTBX_CONFIG`
    pub fn load_from_file(path: Option<&Path>) -> ConfigResult<Arc<ConfigManager>> {
        let transport_override = std::env::var(env::TRANSPORT).ok();
        let config = Self::build(path, transport_override.as_deref(), true)?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            transport = %config.transport.kind,
            broker = config.transport.provider(),
            workers = config.service.workers,
            config_file = ?path,
            "Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            config_file: path.map(Path::to_path_buf),
        }))
    }

    /// Wrap an already-built configuration (tests and embedded use)
    pub fn from_config(config: DlstbxConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            config_file: None,
        }))
    }

    pub fn config(&self) -> &DlstbxConfig {
        &self.config
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Configuration as JSON with credentials masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    fn build(
        path: Option<&Path>,
        transport_override: Option<&str>,
        with_environment: bool,
    ) -> ConfigResult<DlstbxConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DlstbxConfig::default())?);

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigurationError::config_file_not_found(path));
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        if with_environment {
            builder = builder.add_source(
                config::Environment::with_prefix(env::CONFIG_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        if let Some(kind) = transport_override {
            builder = builder.set_override("transport.kind", kind.to_lowercase())?;
        }

        let config: DlstbxConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn sanitize_config_for_logging(config: &DlstbxConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        Self::mask_urls(&mut config_json);
        config_json
    }

    /// Hide the password component of any connection string
    fn mask_urls(value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if key == "url" {
                        if let serde_json::Value::String(s) = val {
                            *s = Self::mask_url(s);
                        }
                    } else {
                        Self::mask_urls(val);
                    }
                }
            }
            serde_json::Value::Array(items) => items.iter_mut().for_each(Self::mask_urls),
            _ => {}
        }
    }

    fn mask_url(url: &str) -> String {
        let Some((scheme, rest)) = url.split_once("://") else {
            return url.to_string();
        };
        let Some((credentials, host)) = rest.split_once('@') else {
            return url.to_string();
        };
        match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => url.to_string(),
        }
    }
}
