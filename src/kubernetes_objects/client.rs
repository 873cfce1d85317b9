use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{Instrument, instrument, trace_span};
use tracing_error::{ExtractSpanTrace, SpanTrace};

use super::gitops_config::GitOpsConfig;
use crate::error::SpannedErr;

#[derive(Error, Debug)]
pub enum KubeClientError {
    #[error("{kind} '{name}' not found")]
    NotFound {
        kind: &'static str,
        name: String,
        span_trace: SpanTrace,
    },

    #[error("Conflict while writing {kind} '{name}': {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
        span_trace: SpanTrace,
    },

    #[error("Kubernetes client error: {0}")]
    Api(SpannedErr<kube::Error>),
}

impl ExtractSpanTrace for KubeClientError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            KubeClientError::NotFound { span_trace, .. } => Some(span_trace),
            KubeClientError::Conflict { span_trace, .. } => Some(span_trace),
            KubeClientError::Api(e) => e.span_trace(),
        }
    }
}

impl KubeClientError {
    pub(crate) fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => KubeClientError::NotFound {
                kind,
                name: name.to_string(),
                span_trace: SpanTrace::capture(),
            },
            kube::Error::Api(ref response) if response.code == 409 => KubeClientError::Conflict {
                kind,
                name: name.to_string(),
                message: response.message.clone(),
                span_trace: SpanTrace::capture(),
            },
            err => KubeClientError::Api(SpannedErr::capture(err)),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        KubeClientError::NotFound {
            kind,
            name: name.to_string(),
            span_trace: SpanTrace::capture(),
        }
    }

    pub(crate) fn conflict(kind: &'static str, name: &str, message: &str) -> Self {
        KubeClientError::Conflict {
            kind,
            name: name.to_string(),
            message: message.to_string(),
            span_trace: SpanTrace::capture(),
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, KubeClientError::Conflict { .. })
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, KubeClientError::NotFound { .. })
    }
}

/// Every cluster operation the operator performs. Writes use optimistic concurrency:
/// objects carrying a stale resourceVersion fail with [`KubeClientError::Conflict`].
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_gitops_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GitOpsConfig>, KubeClientError>;

    /// Lists configurations in the watched namespace, or cluster-wide.
    async fn list_gitops_configs(&self) -> Result<Vec<GitOpsConfig>, KubeClientError>;

    /// Full update of spec and metadata. Status is ignored by the API server.
    async fn replace_gitops_config(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError>;

    /// Writes `config.status` through the status subresource only.
    async fn update_gitops_config_status(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError>;

    async fn get_namespace(&self, name: &str) -> Result<Namespace, KubeClientError>;

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, KubeClientError>;

    async fn create_job(&self, job: &Job) -> Result<Job, KubeClientError>;

    /// Deletes with background propagation so the Job's pods go with it.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeClientError>;

    async fn list_job_pods(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Vec<Pod>, KubeClientError>;

    async fn get_cronjob(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CronJob>, KubeClientError>;

    async fn create_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError>;

    async fn replace_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError>;

    async fn list_cronjobs(&self, namespace: &str) -> Result<Vec<CronJob>, KubeClientError>;

    async fn delete_cronjob(&self, namespace: &str, name: &str) -> Result<(), KubeClientError>;
}

pub struct KubeClientImpl {
    client: Client,
    watch_namespace: Option<String>,
    field_manager: String,
}

impl KubeClientImpl {
    pub fn new(client: Client, watch_namespace: Option<String>, field_manager: String) -> Self {
        Self {
            client,
            watch_namespace,
            field_manager,
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn configs(&self, namespace: &str) -> Api<GitOpsConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cronjobs(&self, namespace: &str) -> Api<CronJob> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    #[instrument("get_gitops_config", level = "trace", skip(self))]
    async fn get_gitops_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GitOpsConfig>, KubeClientError> {
        self.configs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| KubeClientError::from_kube("GitOpsConfig", name, e))
    }

    #[instrument("list_gitops_configs", level = "trace", skip(self))]
    async fn list_gitops_configs(&self) -> Result<Vec<GitOpsConfig>, KubeClientError> {
        let api: Api<GitOpsConfig> = match &self.watch_namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| KubeClientError::from_kube("GitOpsConfig", "*", e))
    }

    async fn replace_gitops_config(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError> {
        let name = config.name_any();
        self.configs(&namespace_of(config))
            .replace(&name, &self.post_params(), config)
            .instrument(trace_span!("replace_gitops_config", gitops_config_name = %name))
            .await
            .map_err(|e| KubeClientError::from_kube("GitOpsConfig", &name, e))
    }

    async fn update_gitops_config_status(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError> {
        let name = config.name_any();
        let status = config.status.clone().unwrap_or_default();
        // Explicit nulls so fields absent from the new status are cleared.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": config.resource_version() },
            "status": {
                "state": status.state,
                "startTime": status.start_time,
                "completionTime": status.completion_time,
                "message": status.message,
                "lastScheduleTime": status.last_schedule_time,
            }
        });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.configs(&namespace_of(config))
            .patch_status(&name, &params, &Patch::Merge(&patch))
            .instrument(trace_span!("update_gitops_config_status", gitops_config_name = %name))
            .await
            .map_err(|e| KubeClientError::from_kube("GitOpsConfig", &name, e))
    }

    #[instrument("get_namespace", level = "trace", skip(self))]
    async fn get_namespace(&self, name: &str) -> Result<Namespace, KubeClientError> {
        Api::<Namespace>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| KubeClientError::from_kube("Namespace", name, e))
    }

    #[instrument("list_jobs", level = "trace", skip(self))]
    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, KubeClientError> {
        self.jobs(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| KubeClientError::from_kube("Job", label_selector, e))
    }

    async fn create_job(&self, job: &Job) -> Result<Job, KubeClientError> {
        let name = job.name_any();
        self.jobs(&namespace_of(job))
            .create(&self.post_params(), job)
            .instrument(trace_span!("create_job", job_name = %name))
            .await
            .map_err(|e| KubeClientError::from_kube("Job", &name, e))
    }

    #[instrument("delete_job", level = "trace", skip(self))]
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeClientError> {
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| KubeClientError::from_kube("Job", name, e))
    }

    #[instrument("list_job_pods", level = "trace", skip(self))]
    async fn list_job_pods(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Vec<Pod>, KubeClientError> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await
            .map(|list| list.items)
            .map_err(|e| KubeClientError::from_kube("Pod", job_name, e))
    }

    #[instrument("get_cronjob", level = "trace", skip(self))]
    async fn get_cronjob(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CronJob>, KubeClientError> {
        self.cronjobs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| KubeClientError::from_kube("CronJob", name, e))
    }

    async fn create_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError> {
        let name = cronjob.name_any();
        self.cronjobs(&namespace_of(cronjob))
            .create(&self.post_params(), cronjob)
            .instrument(trace_span!("create_cronjob", cronjob_name = %name))
            .await
            .map_err(|e| KubeClientError::from_kube("CronJob", &name, e))
    }

    async fn replace_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError> {
        let name = cronjob.name_any();
        self.cronjobs(&namespace_of(cronjob))
            .replace(&name, &self.post_params(), cronjob)
            .instrument(trace_span!("replace_cronjob", cronjob_name = %name))
            .await
            .map_err(|e| KubeClientError::from_kube("CronJob", &name, e))
    }

    #[instrument("list_cronjobs", level = "trace", skip(self))]
    async fn list_cronjobs(&self, namespace: &str) -> Result<Vec<CronJob>, KubeClientError> {
        self.cronjobs(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| KubeClientError::from_kube("CronJob", namespace, e))
    }

    #[instrument("delete_cronjob", level = "trace", skip(self))]
    async fn delete_cronjob(&self, namespace: &str, name: &str) -> Result<(), KubeClientError> {
        self.cronjobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| KubeClientError::from_kube("CronJob", name, e))
    }
}
