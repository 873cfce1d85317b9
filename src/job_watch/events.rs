use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use kube::runtime::watcher;

/// A Job transition as seen by the watch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobEvent {
    Added(Job),
    Updated { old: Job, new: Job },
    Deleted(Job),
}

#[async_trait]
pub(crate) trait JobEventHandler: Send + Sync {
    async fn on_add(&self, job: &Job);

    async fn on_update(&self, old: &Job, new: &Job);

    async fn on_delete(&self, job: &Job);
}

pub(crate) async fn dispatch(handler: &dyn JobEventHandler, event: &JobEvent) {
    match event {
        JobEvent::Added(job) => handler.on_add(job).await,
        JobEvent::Updated { old, new } => handler.on_update(old, new).await,
        JobEvent::Deleted(job) => handler.on_delete(job).await,
    }
}

/// Turns raw watcher events into [`JobEvent`]s by remembering the last state of each Job.
///
/// A relist (watch restart) yields `Updated` for known Jobs, so handlers can tell a
/// redelivered terminal state from a new one, and `Deleted` for Jobs missing from it.
#[derive(Debug, Default)]
pub(crate) struct JobEventSource {
    known: HashMap<String, Job>,
    relisted: Option<HashSet<String>>,
}

fn identity(job: &Job) -> String {
    job.uid()
        .unwrap_or_else(|| format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any()))
}

impl JobEventSource {
    pub(crate) fn observe(&mut self, event: watcher::Event<Job>) -> Vec<JobEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(job) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(identity(&job));
                }
                self.apply(job).into_iter().collect()
            }
            watcher::Event::Apply(job) => self.apply(job).into_iter().collect(),
            watcher::Event::Delete(job) => {
                self.known.remove(&identity(&job));
                vec![JobEvent::Deleted(job)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(JobEvent::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, job: Job) -> Option<JobEvent> {
        match self.known.insert(identity(&job), job.clone()) {
            None => Some(JobEvent::Added(job)),
            // Same resourceVersion: a relist redelivering what we already handled.
            Some(old) if old.resource_version().is_some()
                && old.resource_version() == job.resource_version() =>
            {
                None
            }
            Some(old) => Some(JobEvent::Updated { old, new: job }),
        }
    }
}
