use duration_str::deserialize_duration;
use std::time::Duration;

use serde::Deserialize;

/// Timing and parallelism of the reconcile loop.
#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct ControllerConfig {
    /// Reconciles running at once across distinct GitOpsConfigs.
    #[serde(default = "default_concurrency")]
    pub(crate) concurrency: u16,

    /// Delay before retrying while a previous Job is still running.
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_job_poll_interval"
    )]
    pub(crate) job_poll_interval: Duration,

    /// Delay between teardown progress checks and finalizer removal retries.
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_deletion_poll_interval"
    )]
    pub(crate) deletion_poll_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_backoff_base"
    )]
    pub(crate) error_backoff_base: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_backoff_max"
    )]
    pub(crate) error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_poll_interval: default_job_poll_interval(),
            deletion_poll_interval: default_deletion_poll_interval(),
            error_backoff_base: default_error_backoff_base(),
            error_backoff_max: default_error_backoff_max(),
        }
    }
}

const fn default_concurrency() -> u16 {
    4
}
const fn default_job_poll_interval() -> Duration {
    Duration::from_secs(5)
}
const fn default_deletion_poll_interval() -> Duration {
    Duration::from_secs(5)
}
const fn default_error_backoff_base() -> Duration {
    Duration::from_millis(5)
}
const fn default_error_backoff_max() -> Duration {
    Duration::from_secs(1000)
}
