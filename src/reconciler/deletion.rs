use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::Context;
use super::error::ReconcileError;
use crate::kubernetes_objects::gitops_config::{ACTION_LABEL, GitOpsConfig};
use crate::kubernetes_objects::renderer::JobAction;

/// Waiting reasons after which a processor container can never start.
const UNRECOVERABLE_IMAGE_REASONS: [&str; 3] =
    ["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

fn counts(job: &Job) -> (i32, i32, i32) {
    let status = job.status.clone().unwrap_or_default();
    (
        status.active.unwrap_or(0),
        status.succeeded.unwrap_or(0),
        status.failed.unwrap_or(0),
    )
}

fn is_delete_job(job: &Job) -> bool {
    job.labels()
        .get(ACTION_LABEL)
        .is_some_and(|action| action == JobAction::Delete.as_str())
}

impl Context {
    /// Tears down a GitOpsConfig that is being deleted, releasing the finalizer once
    /// the delete Job has succeeded or can never succeed.
    #[instrument("manage_deletion", skip(self, config), fields(gitops_config = %config.key()))]
    pub(super) async fn manage_deletion(
        &self,
        config: GitOpsConfig,
    ) -> Result<Action, ReconcileError> {
        if !config.has_finalizer() {
            return Ok(Action::await_change());
        }

        let namespace_name = config.namespace().unwrap_or_default();
        let namespace = self.client.get_namespace(&namespace_name).await?;
        if namespace.meta().deletion_timestamp.is_some() {
            info!(
                "Namespace '{}' is terminating. Releasing GitOpsConfig '{}' without a delete Job...",
                namespace_name,
                config.key()
            );
            return self.release(config).await;
        }

        let jobs = self.owned_jobs(&config).await?;
        if let [job] = jobs.as_slice() {
            if let Some(reason) = self.unrecoverable_image_reason(job).await? {
                warn!(
                    "Job '{}' of GitOpsConfig '{}' is stuck with '{}'. Deleting it and releasing the GitOpsConfig...",
                    job.name_any(),
                    config.key(),
                    reason
                );
                match self.client.delete_job(&namespace_name, &job.name_any()).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                return self.release(config).await;
            }
        }

        let delete_jobs: Vec<&Job> = jobs.iter().filter(|job| is_delete_job(job)).collect();
        let Some(delete_job) = delete_jobs.first() else {
            info!(
                "Launching delete Job for GitOpsConfig '{}'...",
                config.key()
            );
            self.create_job(&config, JobAction::Delete).await?;
            return Ok(Action::requeue(self.settings.deletion_poll_interval));
        };

        if delete_jobs.len() > 1 {
            warn!(
                "GitOpsConfig '{}' has {} delete Jobs. Inspecting '{}' only.",
                config.key(),
                delete_jobs.len(),
                delete_job.name_any()
            );
        }

        let (_, succeeded, _) = counts(delete_job);
        if succeeded > 0 {
            info!(
                "Delete Job '{}' succeeded. Releasing GitOpsConfig '{}'...",
                delete_job.name_any(),
                config.key()
            );
            return self.release(config).await;
        }

        info!(
            "Delete Job '{}' is still running. Checking again in {} seconds...",
            delete_job.name_any(),
            self.settings.deletion_poll_interval.as_secs()
        );
        Ok(Action::requeue(self.settings.deletion_poll_interval))
    }

    /// Returns the waiting reason when `job`'s only pod can never pull its image.
    async fn unrecoverable_image_reason(
        &self,
        job: &Job,
    ) -> Result<Option<String>, ReconcileError> {
        let (active, succeeded, failed) = counts(job);
        if active != 1 || succeeded != 0 || failed != 0 {
            return Ok(None);
        }

        let namespace = job.namespace().unwrap_or_default();
        let pods = self.client.list_job_pods(&namespace, &job.name_any()).await?;
        let [pod] = pods.as_slice() else {
            return Ok(None);
        };
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        let [container] = statuses else {
            return Ok(None);
        };

        Ok(container
            .state
            .as_ref()
            .and_then(|state| state.waiting.as_ref())
            .and_then(|waiting| waiting.reason.clone())
            .filter(|reason| UNRECOVERABLE_IMAGE_REASONS.contains(&reason.as_str())))
    }

    /// Removes the finalizer. Conflicts are retried after a fixed delay.
    async fn release(&self, mut config: GitOpsConfig) -> Result<Action, ReconcileError> {
        config.remove_finalizer();
        match self.client.replace_gitops_config(&config).await {
            Ok(_) => {
                info!("Finalizer removed from GitOpsConfig '{}'.", config.key());
                Ok(Action::await_change())
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    "Conflict while removing finalizer from GitOpsConfig '{}'. Retrying in {} seconds...",
                    config.key(),
                    self.settings.deletion_poll_interval.as_secs()
                );
                Ok(Action::requeue(self.settings.deletion_poll_interval))
            }
            Err(e) if e.is_not_found() => Ok(Action::await_change()),
            Err(e) => Err(e.into()),
        }
    }
}
