use std::time::Duration;

use kube::Resource;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument};

use super::Context;
use super::error::ReconcileError;
use crate::kubernetes_objects::gitops_config::{GitOpsConfig, TriggerType};
use crate::kubernetes_objects::renderer::JobAction;

impl Context {
    /// One pass of the GitOpsConfig state machine. Always re-reads the object so
    /// webhook-triggered passes see the latest spec.
    pub(super) async fn reconcile_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ReconcileError> {
        let Some(mut config) = self.client.get_gitops_config(namespace, name).await? else {
            debug!("GitOpsConfig '{namespace}/{name}' no longer exists.");
            return Ok(Action::await_change());
        };

        if config.meta().deletion_timestamp.is_some() {
            return self.manage_deletion(config).await;
        }

        if !config.is_initialized() {
            return self.initialize(config).await;
        }

        if config.sync_finalizer() {
            self.client.replace_gitops_config(&config).await?;
            info!(
                "Finalizer of GitOpsConfig '{}' synchronized with its deletion mode.",
                config.key()
            );
            return Ok(Action::requeue(Duration::ZERO));
        }

        self.dispatch_triggers(&config).await
    }

    #[instrument("initialize", skip(self, config), fields(gitops_config = %config.key()))]
    async fn initialize(&self, mut config: GitOpsConfig) -> Result<Action, ReconcileError> {
        if let Err(e) = config.apply_defaults() {
            // Retrying cannot help. The next spec edit triggers a new pass.
            error!(
                "GitOpsConfig '{}' cannot be initialized: {}",
                config.key(),
                e
            );
            return Ok(Action::await_change());
        }
        config.sync_finalizer();
        config.mark_initialized();

        self.client.replace_gitops_config(&config).await?;
        info!("GitOpsConfig '{}' initialized.", config.key());
        Ok(Action::requeue(Duration::ZERO))
    }

    #[instrument("dispatch_triggers", skip(self, config), fields(gitops_config = %config.key()))]
    async fn dispatch_triggers(&self, config: &GitOpsConfig) -> Result<Action, ReconcileError> {
        if config.has_trigger(TriggerType::Periodic) {
            if let Err(e) = self.ensure_cronjob(config).await {
                error!(
                    "Failed to ensure CronJob for GitOpsConfig '{}': {}",
                    config.key(),
                    e
                );
            }
        } else {
            self.prune_leftover_cronjobs(config).await?;
        }

        if config.has_trigger(TriggerType::Change) || config.has_trigger(TriggerType::Webhook) {
            return match self.create_job(config, JobAction::Create).await {
                Err(e @ ReconcileError::Render(..)) => {
                    error!("{e}. Skipping Job creation until the next trigger.");
                    Ok(Action::await_change())
                }
                other => other,
            };
        }

        Ok(Action::await_change())
    }
}
