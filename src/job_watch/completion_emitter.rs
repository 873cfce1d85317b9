use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, instrument};

use super::events::JobEventHandler;
use crate::kubernetes_objects::events::{EventPublisher, REASON_JOB_FAILED, REASON_JOB_SUCCESSFUL};
use crate::kubernetes_objects::gitops_config::{GitOpsConfig, JOB_OWNER_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Succeeded,
    Failed,
}

fn counts(job: &Job) -> (i32, i32, i32) {
    job.status.as_ref().map_or((0, 0, 0), |s| {
        (
            s.active.unwrap_or(0),
            s.succeeded.unwrap_or(0),
            s.failed.unwrap_or(0),
        )
    })
}

fn is_terminal(job: &Job) -> bool {
    let (active, succeeded, failed) = counts(job);
    active == 0 && succeeded + failed >= 1
}

/// Whether the transition `old -> new` is the moment `new` finished.
pub(crate) fn newly_completed(old: Option<&Job>, new: &Job) -> Option<Completion> {
    let (active, succeeded, failed) = counts(new);
    if active > 0 {
        return None;
    }
    if old.is_some_and(is_terminal) {
        return None;
    }
    if !new.labels().contains_key(JOB_OWNER_LABEL) {
        return None;
    }
    match (succeeded, failed) {
        (1, _) => Some(Completion::Succeeded),
        (0, f) if f > 0 => Some(Completion::Failed),
        _ => None,
    }
}

/// References the owning GitOpsConfig by name and namespace, without reading it.
fn owner_reference(job: &Job) -> Option<ObjectReference> {
    let owner = job.labels().get(JOB_OWNER_LABEL)?;
    Some(ObjectReference {
        api_version: Some(GitOpsConfig::api_version(&()).to_string()),
        kind: Some(GitOpsConfig::kind(&()).to_string()),
        name: Some(owner.clone()),
        namespace: job.namespace(),
        ..Default::default()
    })
}

/// Emits one Event on the owning GitOpsConfig when a Job succeeds or fails.
pub(crate) struct CompletionEmitter {
    publisher: Arc<dyn EventPublisher>,
}

impl CompletionEmitter {
    pub(crate) fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    #[instrument("emit_completion", skip(self, old, new), fields(job_name = %new.name_any()))]
    async fn handle(&self, old: Option<&Job>, new: &Job) {
        let Some(completion) = newly_completed(old, new) else {
            return;
        };
        let Some(regarding) = owner_reference(new) else {
            return;
        };
        let job_name = new.name_any();
        let (type_, reason, note) = match completion {
            Completion::Succeeded => (
                EventType::Normal,
                REASON_JOB_SUCCESSFUL,
                format!("Job '{job_name}' finished successfully"),
            ),
            Completion::Failed => (
                EventType::Warning,
                REASON_JOB_FAILED,
                format!("Job '{job_name}' failed"),
            ),
        };
        debug!(
            "Publishing '{}' for GitOpsConfig '{}'...",
            reason,
            regarding.name.as_deref().unwrap_or_default()
        );
        let related = new.object_ref(&());
        self.publisher
            .publish(&regarding, type_, reason, note, Some(related))
            .await;
    }
}

#[async_trait]
impl JobEventHandler for CompletionEmitter {
    async fn on_add(&self, job: &Job) {
        self.handle(None, job).await;
    }

    async fn on_update(&self, old: &Job, new: &Job) {
        self.handle(Some(old), new).await;
    }

    async fn on_delete(&self, _job: &Job) {}
}
