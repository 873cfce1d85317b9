pub(crate) mod controller;
mod raw;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, instrument};

use self::controller::ControllerConfig;
use self::raw::RawConfig;
pub use self::raw::ConfigParseError;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) watch_namespace: Option<String>,
    pub(crate) field_manager: String,
    pub(crate) controller: ControllerConfig,
    pub(crate) templates: TemplatesConfig,
    /// `None` when the webhook listener is disabled.
    pub(crate) webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone)]
pub(crate) struct TemplatesConfig {
    pub(crate) job: Option<PathBuf>,
    pub(crate) cronjob: Option<PathBuf>,
    pub(crate) processor_image: String,
}

#[derive(Debug, Clone)]
pub(crate) struct WebhookConfig {
    pub(crate) listen: SocketAddr,
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{0}': {1}")]
    Read(String, std::io::Error),

    #[error("Failed to parse config file '{0}': {1}")]
    Parse(String, serde_yaml::Error),

    #[error("Invalid config file '{0}': {1}")]
    Invalid(String, ConfigParseError),
}

impl Config {
    /// Reads the YAML config. A missing file yields the defaults.
    #[instrument("load_config")]
    pub(crate) async fn new_from_file(path: &Path) -> Result<Config, ConfigLoadError> {
        let path_name = path.display().to_string();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str::<RawConfig>(&content)
                .map_err(|e| ConfigLoadError::Parse(path_name.clone(), e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Config file '{path_name}' not found. Using defaults...");
                RawConfig::default()
            }
            Err(e) => return Err(ConfigLoadError::Read(path_name, e)),
        };
        Config::try_from(raw).map_err(|e| ConfigLoadError::Invalid(path_name, e))
    }
}
