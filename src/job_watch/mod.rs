mod completion_emitter;
mod events;
mod status_updater;

use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::select;
use tracing::{info, warn};

use crate::kubernetes_objects::client::KubeClient;
use crate::kubernetes_objects::events::EventPublisher;
use crate::kubernetes_objects::gitops_config::JOB_OWNER_LABEL;
use crate::shutdown::Shutdown;

pub(crate) use self::completion_emitter::CompletionEmitter;
pub(crate) use self::events::{JobEventHandler, JobEventSource, dispatch};
pub(crate) use self::status_updater::StatusUpdater;

/// The two handlers fed by the Job watch. They share no state.
pub(crate) fn default_handlers(
    client: Arc<dyn KubeClient>,
    publisher: Arc<dyn EventPublisher>,
) -> Vec<Arc<dyn JobEventHandler>> {
    vec![
        Arc::new(CompletionEmitter::new(publisher)),
        Arc::new(StatusUpdater::new(client)),
    ]
}

/// Watches Jobs carrying the owner label and feeds every transition to each handler.
pub(crate) async fn run_job_watch(
    client: Client,
    watch_namespace: Option<&str>,
    handlers: Vec<Arc<dyn JobEventHandler>>,
    mut shutdown: Shutdown,
) {
    let api: Api<Job> = match watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let mut stream = watcher(api, watcher::Config::default().labels(JOB_OWNER_LABEL))
        .default_backoff()
        .boxed();
    let mut source = JobEventSource::default();

    info!("Watching Jobs labeled '{}'...", JOB_OWNER_LABEL);
    loop {
        select! {
            _ = shutdown.wait() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for job_event in source.observe(event) {
                        join_all(handlers.iter().map(|h| dispatch(h.as_ref(), &job_event))).await;
                    }
                }
                Some(Err(e)) => warn!("Job watch error: {}. Retrying...", e),
                None => break,
            }
        }
    }
    info!("Job watch stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::events::tests::RecordingEventPublisher;
    use crate::kubernetes_objects::fake::FakeKubeClient;
    use crate::kubernetes_objects::gitops_config::GitOpsState;
    use crate::kubernetes_objects::gitops_config::tests::sample_config;
    use crate::reconciler::job_orchestrator::tests::{owned_job, time};
    use k8s_openapi::api::batch::v1::JobStatus;

    fn status(active: i32, succeeded: i32) -> Option<JobStatus> {
        Some(JobStatus {
            active: Some(active),
            succeeded: Some(succeeded),
            start_time: Some(time("2024-01-01T00:00:00Z")),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_watch_events_drive_both_handlers() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(sample_config("app", vec![]));
        let publisher = Arc::new(RecordingEventPublisher::default());
        let handlers = default_handlers(client.clone(), publisher.clone());
        let config = client.config("default", "app").unwrap();

        let mut running = owned_job(&config, "gitopsconfig-app-abc123", "create", status(1, 0));
        running.metadata.resource_version = Some("1".to_string());
        let mut done = owned_job(&config, "gitopsconfig-app-abc123", "create", status(0, 1));
        done.metadata.resource_version = Some("2".to_string());

        let mut source = JobEventSource::default();
        for event in [watcher::Event::Apply(running), watcher::Event::Apply(done)] {
            for job_event in source.observe(event) {
                for handler in &handlers {
                    dispatch(handler.as_ref(), &job_event).await;
                }
            }
        }

        assert_eq!(publisher.events.lock().len(), 1);
        assert_eq!(
            client.config("default", "app").unwrap().status.and_then(|s| s.state),
            Some(GitOpsState::Success)
        );
        assert_eq!(client.state.lock().status_writes, 2);
    }
}
