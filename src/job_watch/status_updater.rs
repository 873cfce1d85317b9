use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use super::events::JobEventHandler;
use crate::kubernetes_objects::client::{KubeClient, KubeClientError};
use crate::kubernetes_objects::gitops_config::{GitOpsConfigStatus, GitOpsState, JOB_OWNER_LABEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    Written,
    /// Nothing to report, or the status already says it.
    Unchanged,
    OwnerGone,
    /// The GitOpsConfig already tracks a newer Job.
    Stale,
}

/// The status a Job implies for its owner, plus the owner's name.
pub(crate) fn status_from_job(job: &Job) -> Option<(String, GitOpsConfigStatus)> {
    let owner = job.labels().get(JOB_OWNER_LABEL)?.clone();
    let status = job.status.as_ref()?;
    let start_time = status.start_time.clone()?;

    let active = status.active.unwrap_or(0);
    let succeeded = status.succeeded.unwrap_or(0);
    let failed = status.failed.unwrap_or(0);
    let state = if active > 0 {
        Some(GitOpsState::InProgress)
    } else if succeeded == 1 {
        Some(GitOpsState::Success)
    } else if succeeded == 0 && failed > 0 {
        Some(GitOpsState::Failure)
    } else {
        None
    };

    Some((
        owner,
        GitOpsConfigStatus {
            state,
            start_time: Some(start_time),
            completion_time: status.completion_time.clone(),
            ..Default::default()
        },
    ))
}

/// Mirrors Job progress into the owning GitOpsConfig's status subresource.
pub(crate) struct StatusUpdater {
    client: Arc<dyn KubeClient>,
}

impl StatusUpdater {
    pub(crate) fn new(client: Arc<dyn KubeClient>) -> Self {
        Self { client }
    }

    #[instrument("update_status", skip(self, job), fields(job_name = %job.name_any()))]
    pub(crate) async fn apply(&self, job: &Job) -> Result<UpdateOutcome, KubeClientError> {
        let Some((owner, computed)) = status_from_job(job) else {
            return Ok(UpdateOutcome::Unchanged);
        };
        let namespace = job.namespace().unwrap_or_default();

        let Some(mut config) = self.client.get_gitops_config(&namespace, &owner).await? else {
            return Ok(UpdateOutcome::OwnerGone);
        };

        let current = config.status.clone().unwrap_or_default();
        if let (Some(current_start), Some(new_start)) = (&current.start_time, &computed.start_time)
            && current_start > new_start
        {
            debug!(
                "GitOpsConfig '{}' already tracks a Job started at {:?}. Ignoring Job '{}'.",
                config.key(),
                current_start,
                job.name_any()
            );
            return Ok(UpdateOutcome::Stale);
        }

        let updated = GitOpsConfigStatus {
            message: current.message.clone(),
            last_schedule_time: current.last_schedule_time.clone(),
            ..computed
        };
        if updated == current {
            return Ok(UpdateOutcome::Unchanged);
        }

        config.status = Some(updated);
        self.client.update_gitops_config_status(&config).await?;
        debug!("Status of GitOpsConfig '{}' updated.", config.key());
        Ok(UpdateOutcome::Written)
    }

    async fn handle(&self, job: &Job) {
        match self.apply(job).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => warn!(
                "Status of the owner of Job '{}' changed concurrently. Skipping this update: {}",
                job.name_any(),
                e
            ),
            Err(e) => warn!(
                "Failed to update status for Job '{}': {}",
                job.name_any(),
                e
            ),
        }
    }
}

#[async_trait]
impl JobEventHandler for StatusUpdater {
    async fn on_add(&self, job: &Job) {
        self.handle(job).await;
    }

    async fn on_update(&self, _old: &Job, new: &Job) {
        self.handle(new).await;
    }

    async fn on_delete(&self, job: &Job) {
        self.handle(job).await;
    }
}
