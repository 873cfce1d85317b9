use k8s_openapi::api::batch::v1::Job;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{Instrument, error, info, instrument, trace_span};
use tracing_error::SpanTrace;

use super::Context;
use super::error::ReconcileError;
use crate::kubernetes_objects::gitops_config::{GitOpsConfig, JOB_OWNER_LABEL};
use crate::kubernetes_objects::ownership::is_controller_owned_by;
use crate::kubernetes_objects::renderer::JobAction;

/// Running, or created but not yet started.
pub(super) fn job_is_pending(job: &Job) -> bool {
    let Some(status) = job.status.as_ref() else {
        return true;
    };
    status.active.unwrap_or(0) != 0 || status.start_time.is_none()
}

/// Makes `config` the controlling owner, replacing any previous controller reference.
pub(super) fn set_controller_owner(
    meta: &mut ObjectMeta,
    config: &GitOpsConfig,
) -> Result<(), ReconcileError> {
    let Some(mut owner) = config.controller_owner_ref(&()) else {
        return Err(ReconcileError::MissingUid(
            config.key(),
            SpanTrace::capture(),
        ));
    };
    owner.block_owner_deletion = Some(true);
    let references = meta.owner_references.get_or_insert_with(Vec::new);
    references.retain(|r| r.controller != Some(true));
    references.push(owner);
    Ok(())
}

impl Context {
    /// Jobs whose controller is exactly this GitOpsConfig. The label narrows the list,
    /// the owner uid rules out a deleted and recreated namesake.
    pub(super) async fn owned_jobs(&self, config: &GitOpsConfig) -> Result<Vec<Job>, ReconcileError> {
        let namespace = config.namespace().unwrap_or_default();
        let selector = format!("{}={}", JOB_OWNER_LABEL, config.name_any());
        let owner = config.owner_identity();

        let jobs = self
            .client
            .list_jobs(&namespace, &selector)
            .instrument(trace_span!("list_owned_jobs", kubernetes_namespace = %namespace))
            .await?;
        Ok(jobs
            .into_iter()
            .filter(|job| is_controller_owned_by(&owner, job.owner_references()))
            .collect())
    }

    /// Launches a Job for `action` unless a previous one is still pending.
    #[instrument(
        "create_job",
        skip(self, config),
        fields(gitops_config = %config.key(), action = action.as_str())
    )]
    pub(super) async fn create_job(
        &self,
        config: &GitOpsConfig,
        action: JobAction,
    ) -> Result<Action, ReconcileError> {
        let jobs = self.owned_jobs(config).await?;
        if let Some(pending) = jobs.iter().find(|job| job_is_pending(job)) {
            info!(
                "Job '{}' of GitOpsConfig '{}' has not finished yet. Retrying in {} seconds...",
                pending.name_any(),
                config.key(),
                self.settings.job_poll_interval.as_secs()
            );
            return Ok(Action::requeue(self.settings.job_poll_interval));
        }

        let mut job = self
            .renderer
            .render_job(config, action)
            .map_err(|e| ReconcileError::Render(config.key(), e))?;
        set_controller_owner(&mut job.metadata, config)?;

        let created = self.client.create_job(&job).await?;
        info!(
            "Created {} Job '{}' for GitOpsConfig '{}'.",
            action.as_str(),
            created.name_any(),
            config.key()
        );
        Ok(Action::await_change())
    }

    /// Creates or fully replaces the CronJob backing the Periodic trigger.
    #[instrument("ensure_cronjob", skip(self, config), fields(gitops_config = %config.key()))]
    pub(super) async fn ensure_cronjob(&self, config: &GitOpsConfig) -> Result<(), ReconcileError> {
        let mut cronjob = self
            .renderer
            .render_cronjob(config)
            .map_err(|e| ReconcileError::Render(config.key(), e))?;
        set_controller_owner(&mut cronjob.metadata, config)?;

        let namespace = cronjob
            .namespace()
            .or_else(|| config.namespace())
            .unwrap_or_default();
        let name = cronjob.name_any();

        match self.client.get_cronjob(&namespace, &name).await? {
            None => {
                self.client.create_cronjob(&cronjob).await?;
                info!(
                    "Created CronJob '{}' for GitOpsConfig '{}'.",
                    name,
                    config.key()
                );
            }
            Some(existing) => {
                cronjob.metadata.resource_version = existing.resource_version();
                self.client.replace_cronjob(&cronjob).await?;
                info!(
                    "Updated CronJob '{}' for GitOpsConfig '{}'.",
                    name,
                    config.key()
                );
            }
        }
        Ok(())
    }

    /// Deletes CronJobs left behind after the Periodic trigger was removed.
    #[instrument("prune_cronjobs", skip(self, config), fields(gitops_config = %config.key()))]
    pub(super) async fn prune_leftover_cronjobs(
        &self,
        config: &GitOpsConfig,
    ) -> Result<(), ReconcileError> {
        let namespace = config.namespace().unwrap_or_default();
        let owner = config.owner_identity();

        let leftovers = self
            .client
            .list_cronjobs(&namespace)
            .await?
            .into_iter()
            .filter(|cronjob| is_controller_owned_by(&owner, cronjob.owner_references()));

        for cronjob in leftovers {
            let name = cronjob.name_any();
            match self.client.delete_cronjob(&namespace, &name).await {
                Ok(()) => info!(
                    "Deleted CronJob '{}' of GitOpsConfig '{}' since it has no Periodic trigger anymore.",
                    name,
                    config.key()
                ),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Failed to delete CronJob '{}': {}", name, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
