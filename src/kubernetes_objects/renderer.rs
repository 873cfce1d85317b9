use std::path::Path;

use k8s_openapi::api::batch::v1::{CronJob, Job};
use minijinja::{Environment, UndefinedBehavior, Value, context};
use rand::Rng;
use thiserror::Error;
use tracing::{info, instrument};
use tracing_error::{ExtractSpanTrace, SpanTrace};

use super::gitops_config::{GitOpsConfig, JOB_OWNER_LABEL};
use crate::error::{SpannedErr, SpannedExt};

const DEFAULT_JOB_TEMPLATE: &str = include_str!("templates/job.yaml.j2");
const DEFAULT_CRONJOB_TEMPLATE: &str = include_str!("templates/cronjob.yaml.j2");
/// Pod template shared by Jobs and CronJobs. Custom templates may include it by this name.
const POD_TEMPLATE_NAME: &str = "pod_template.yaml.j2";
const POD_TEMPLATE: &str = include_str!("templates/pod_template.yaml.j2");

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobAction {
    Create,
    Delete,
}

impl JobAction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            JobAction::Create => "create",
            JobAction::Delete => "delete",
        }
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to read template '{0}': {1}")]
    ReadTemplate(String, SpannedErr<std::io::Error>),

    #[error("Template error: {0}")]
    Template(SpannedErr<minijinja::Error>),

    #[error("Rendered manifest is not a valid {0}: {1}")]
    InvalidManifest(&'static str, SpannedErr<serde_yaml::Error>),

    #[error("GitOpsConfig '{0}' has no Periodic trigger with a cron schedule")]
    MissingSchedule(String, SpanTrace),
}

impl ExtractSpanTrace for RenderError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            RenderError::ReadTemplate(_, e) => e.span_trace(),
            RenderError::Template(e) => e.span_trace(),
            RenderError::InvalidManifest(_, e) => e.span_trace(),
            RenderError::MissingSchedule(_, s) => Some(s),
        }
    }
}

/// Turns a configuration snapshot into the workload that applies (or deletes) it.
///
/// Implementations own naming: Jobs get a unique suffix, the CronJob name is
/// derived from the configuration name only. Both carry the owner and action labels.
pub trait ManifestRenderer: Send + Sync {
    fn render_job(&self, config: &GitOpsConfig, action: JobAction) -> Result<Job, RenderError>;

    fn render_cronjob(&self, config: &GitOpsConfig) -> Result<CronJob, RenderError>;
}

pub struct TemplateRenderer {
    env: Environment<'static>,
    job_template: String,
    cronjob_template: String,
    default_image: String,
}

impl TemplateRenderer {
    pub fn new(
        job_template: String,
        cronjob_template: String,
        default_image: String,
    ) -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_template(POD_TEMPLATE_NAME, POD_TEMPLATE)
            .with_span_trace()
            .map_err(RenderError::Template)?;

        // Fail at startup rather than on the first reconcile.
        check_syntax(&job_template)?;
        check_syntax(&cronjob_template)?;

        Ok(Self {
            env,
            job_template,
            cronjob_template,
            default_image,
        })
    }

    pub fn with_default_templates(default_image: String) -> Result<Self, RenderError> {
        Self::new(
            DEFAULT_JOB_TEMPLATE.to_string(),
            DEFAULT_CRONJOB_TEMPLATE.to_string(),
            default_image,
        )
    }

    /// Loads templates from disk, falling back to the embedded ones for paths not given.
    #[instrument("load_templates", level = "trace")]
    pub async fn from_paths(
        job_path: Option<&Path>,
        cronjob_path: Option<&Path>,
        default_image: String,
    ) -> Result<Self, RenderError> {
        let job_template = read_template(job_path, DEFAULT_JOB_TEMPLATE).await?;
        let cronjob_template = read_template(cronjob_path, DEFAULT_CRONJOB_TEMPLATE).await?;
        Self::new(job_template, cronjob_template, default_image)
    }

    fn render(
        &self,
        template: &str,
        config: &GitOpsConfig,
        action: JobAction,
        cron: Option<&str>,
    ) -> Result<String, RenderError> {
        let ctx = context! {
            config => Value::from_serialize(config),
            action => action.as_str(),
            id => random_id(),
            cron => cron,
            owner_label => JOB_OWNER_LABEL,
            default_image => &self.default_image,
        };
        self.env
            .render_str(template, ctx)
            .with_span_trace()
            .map_err(RenderError::Template)
    }
}

fn check_syntax(source: &str) -> Result<(), RenderError> {
    Environment::new()
        .template_from_str(source)
        .map(|_| ())
        .with_span_trace()
        .map_err(RenderError::Template)
}

async fn read_template(path: Option<&Path>, fallback: &str) -> Result<String, RenderError> {
    match path {
        Some(path) => {
            info!("Loading template from '{}'...", path.display());
            tokio::fs::read_to_string(path)
                .await
                .with_span_trace()
                .map_err(|e| RenderError::ReadTemplate(path.display().to_string(), e))
        }
        None => Ok(fallback.to_string()),
    }
}

impl ManifestRenderer for TemplateRenderer {
    fn render_job(&self, config: &GitOpsConfig, action: JobAction) -> Result<Job, RenderError> {
        let rendered = self.render(&self.job_template, config, action, None)?;
        serde_yaml::from_str(&rendered)
            .with_span_trace()
            .map_err(|e| RenderError::InvalidManifest("Job", e))
    }

    fn render_cronjob(&self, config: &GitOpsConfig) -> Result<CronJob, RenderError> {
        let Some(cron) = config.periodic_cron() else {
            return Err(RenderError::MissingSchedule(
                config.key(),
                SpanTrace::capture(),
            ));
        };
        let rendered = self.render(&self.cronjob_template, config, JobAction::Create, Some(cron))?;
        serde_yaml::from_str(&rendered)
            .with_span_trace()
            .map_err(|e| RenderError::InvalidManifest("CronJob", e))
    }
}

fn random_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
        .collect()
}
