use std::net::SocketAddr;
use std::path::PathBuf;

use super::controller::ControllerConfig;
use super::{Config, TemplatesConfig, WebhookConfig};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_FIELD_MANAGER: &str = "man10gitops";
const DEFAULT_PROCESSOR_IMAGE: &str = "ghcr.io/man10server/gitops-template-processor:latest";
const DEFAULT_WEBHOOK_LISTEN: &str = "0.0.0.0:8080";

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RawConfig {
    /// Restricts the GitOpsConfig watch to a single namespace.
    #[serde(default)]
    pub(super) watch_namespace: Option<String>,

    #[serde(default)]
    pub(super) field_manager: Option<String>,

    #[serde(default)]
    pub(super) controller: ControllerConfig,

    #[serde(default)]
    pub(super) templates: RawTemplates,

    #[serde(default)]
    pub(super) webhook: RawWebhook,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RawTemplates {
    /// Job template path. The embedded template is used when omitted.
    pub(super) job: Option<PathBuf>,

    /// CronJob template path. The embedded template is used when omitted.
    pub(super) cronjob: Option<PathBuf>,

    /// Image used when a GitOpsConfig does not name its own processor.
    pub(super) processor_image: Option<String>,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RawWebhook {
    pub(super) enabled: Option<bool>,

    /// Example: "0.0.0.0:8080"
    pub(super) listen: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("webhook.listen '{0}' is not a valid socket address")]
    InvalidListenAddress(String),

    #[error("controller.concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("controller.error_backoff_base must not exceed controller.error_backoff_max")]
    BackoffBaseExceedsMax,

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigParseError;
    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        if raw.controller.concurrency == 0 {
            return Err(ConfigParseError::ZeroConcurrency);
        }
        if raw.controller.error_backoff_base > raw.controller.error_backoff_max {
            return Err(ConfigParseError::BackoffBaseExceedsMax);
        }

        let field_manager = non_empty(raw.field_manager, DEFAULT_FIELD_MANAGER, "field_manager")?;
        let processor_image = non_empty(
            raw.templates.processor_image,
            DEFAULT_PROCESSOR_IMAGE,
            "templates.processor_image",
        )?;

        let webhook = if raw.webhook.enabled.unwrap_or(true) {
            let listen = raw
                .webhook
                .listen
                .unwrap_or_else(|| DEFAULT_WEBHOOK_LISTEN.to_string());
            let listen = listen
                .parse::<SocketAddr>()
                .map_err(|_| ConfigParseError::InvalidListenAddress(listen.clone()))?;
            Some(WebhookConfig { listen })
        } else {
            None
        };

        Ok(Config {
            watch_namespace: raw.watch_namespace.filter(|ns| !ns.is_empty()),
            field_manager,
            controller: raw.controller,
            templates: TemplatesConfig {
                job: raw.templates.job,
                cronjob: raw.templates.cronjob,
                processor_image,
            },
            webhook,
        })
    }
}

fn non_empty(
    value: Option<String>,
    default: &str,
    field: &'static str,
) -> Result<String, ConfigParseError> {
    match value {
        None => Ok(default.to_string()),
        Some(v) if v.is_empty() => Err(ConfigParseError::Empty(field)),
        Some(v) => Ok(v),
    }
}
