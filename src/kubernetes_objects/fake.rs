//! In-memory [`KubeClient`] for unit tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

use super::client::{KubeClient, KubeClientError};
use super::gitops_config::GitOpsConfig;

type Key = (String, String);

#[derive(Default)]
pub(crate) struct FakeState {
    pub(crate) configs: BTreeMap<Key, GitOpsConfig>,
    pub(crate) namespaces: BTreeMap<String, Namespace>,
    pub(crate) jobs: BTreeMap<Key, Job>,
    pub(crate) cronjobs: BTreeMap<Key, CronJob>,
    pub(crate) pods: Vec<Pod>,
    pub(crate) config_writes: usize,
    pub(crate) status_writes: usize,
    pub(crate) created_jobs: Vec<String>,
    pub(crate) deleted_jobs: Vec<String>,
    pub(crate) deleted_cronjobs: Vec<String>,
    /// Makes the next config replace fail with a conflict.
    pub(crate) conflict_next_replace: bool,
    next_version: u64,
}

impl FakeState {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }
}

#[derive(Default)]
pub(crate) struct FakeKubeClient {
    pub(crate) state: Mutex<FakeState>,
}

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Equality-based selectors only: `a=b,c=d` or bare `a` for existence.
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => labels.contains_key(term),
        })
}

impl FakeKubeClient {
    pub(crate) fn insert_config(&self, mut config: GitOpsConfig) {
        let mut state = self.state.lock();
        state.bump(&mut config.metadata);
        state.configs.insert(key_of(&config), config);
    }

    pub(crate) fn config(&self, namespace: &str, name: &str) -> Option<GitOpsConfig> {
        self.state.lock().configs.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn insert_namespace(&self, namespace: Namespace) {
        self.state
            .lock()
            .namespaces
            .insert(namespace.name_any(), namespace);
    }

    pub(crate) fn insert_job(&self, job: Job) {
        self.state.lock().jobs.insert(key_of(&job), job);
    }

    pub(crate) fn insert_cronjob(&self, cronjob: CronJob) {
        self.state.lock().cronjobs.insert(key_of(&cronjob), cronjob);
    }

    pub(crate) fn insert_pod(&self, pod: Pod) {
        self.state.lock().pods.push(pod);
    }

    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub(crate) fn cronjobs(&self) -> Vec<CronJob> {
        self.state.lock().cronjobs.values().cloned().collect()
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_gitops_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GitOpsConfig>, KubeClientError> {
        Ok(self.config(namespace, name))
    }

    async fn list_gitops_configs(&self) -> Result<Vec<GitOpsConfig>, KubeClientError> {
        Ok(self.state.lock().configs.values().cloned().collect())
    }

    async fn replace_gitops_config(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError> {
        let mut state = self.state.lock();
        let name = config.name_any();
        if std::mem::take(&mut state.conflict_next_replace) {
            return Err(KubeClientError::conflict("GitOpsConfig", &name, "injected"));
        }
        let k = key_of(config);
        let Some(stored) = state.configs.get(&k) else {
            return Err(KubeClientError::not_found("GitOpsConfig", &name));
        };
        if stored.resource_version() != config.resource_version() {
            return Err(KubeClientError::conflict(
                "GitOpsConfig",
                &name,
                "the object has been modified",
            ));
        }
        let mut updated = config.clone();
        updated.status = stored.status.clone();
        state.bump(&mut updated.metadata);
        state.config_writes += 1;

        let released =
            updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty();
        if released {
            state.configs.remove(&k);
        } else {
            state.configs.insert(k, updated.clone());
        }
        Ok(updated)
    }

    async fn update_gitops_config_status(
        &self,
        config: &GitOpsConfig,
    ) -> Result<GitOpsConfig, KubeClientError> {
        let mut state = self.state.lock();
        let name = config.name_any();
        let k = key_of(config);
        let Some(mut stored) = state.configs.get(&k).cloned() else {
            return Err(KubeClientError::not_found("GitOpsConfig", &name));
        };
        if stored.resource_version() != config.resource_version() {
            return Err(KubeClientError::conflict(
                "GitOpsConfig",
                &name,
                "the object has been modified",
            ));
        }
        stored.status = config.status.clone();
        state.bump(&mut stored.metadata);
        state.status_writes += 1;
        state.configs.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, KubeClientError> {
        self.state
            .lock()
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| KubeClientError::not_found("Namespace", name))
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, KubeClientError> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .filter(|((ns, _), job)| ns == namespace && matches_selector(job.labels(), label_selector))
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, KubeClientError> {
        let mut state = self.state.lock();
        let k = key_of(job);
        if state.jobs.contains_key(&k) {
            return Err(KubeClientError::conflict("Job", &k.1, "already exists"));
        }
        let mut created = job.clone();
        created.metadata.uid = Some(format!("{}-uid", k.1));
        state.bump(&mut created.metadata);
        state.created_jobs.push(k.1.clone());
        state.jobs.insert(k, created.clone());
        Ok(created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeClientError> {
        let mut state = self.state.lock();
        state
            .jobs
            .remove(&key(namespace, name))
            .ok_or_else(|| KubeClientError::not_found("Job", name))?;
        state.deleted_jobs.push(name.to_string());
        Ok(())
    }

    async fn list_job_pods(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Vec<Pod>, KubeClientError> {
        let selector = format!("job-name={job_name}");
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|pod| {
                pod.namespace().as_deref() == Some(namespace)
                    && matches_selector(pod.labels(), &selector)
            })
            .cloned()
            .collect())
    }

    async fn get_cronjob(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CronJob>, KubeClientError> {
        Ok(self.state.lock().cronjobs.get(&key(namespace, name)).cloned())
    }

    async fn create_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError> {
        let mut state = self.state.lock();
        let k = key_of(cronjob);
        if state.cronjobs.contains_key(&k) {
            return Err(KubeClientError::conflict("CronJob", &k.1, "already exists"));
        }
        let mut created = cronjob.clone();
        created.metadata.uid = Some(format!("{}-uid", k.1));
        state.bump(&mut created.metadata);
        state.cronjobs.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_cronjob(&self, cronjob: &CronJob) -> Result<CronJob, KubeClientError> {
        let mut state = self.state.lock();
        let k = key_of(cronjob);
        let Some(stored) = state.cronjobs.get(&k) else {
            return Err(KubeClientError::not_found("CronJob", &k.1));
        };
        if cronjob.resource_version().is_some()
            && stored.resource_version() != cronjob.resource_version()
        {
            return Err(KubeClientError::conflict("CronJob", &k.1, "stale"));
        }
        let mut updated = cronjob.clone();
        state.bump(&mut updated.metadata);
        state.cronjobs.insert(k, updated.clone());
        Ok(updated)
    }

    async fn list_cronjobs(&self, namespace: &str) -> Result<Vec<CronJob>, KubeClientError> {
        Ok(self
            .state
            .lock()
            .cronjobs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_cronjob(&self, namespace: &str, name: &str) -> Result<(), KubeClientError> {
        let mut state = self.state.lock();
        state
            .cronjobs
            .remove(&key(namespace, name))
            .ok_or_else(|| KubeClientError::not_found("CronJob", name))?;
        state.deleted_cronjobs.push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::gitops_config::tests::sample_config;

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let client = FakeKubeClient::default();
        client.insert_config(sample_config("app", vec![]));
        let stale = client.config("default", "app").unwrap();

        client.replace_gitops_config(&stale).await.unwrap();
        let err = client.replace_gitops_config(&stale).await.unwrap_err();

        assert!(err.is_conflict());
    }

    #[test]
    fn test_selector_matching() {
        let labels = BTreeMap::from([
            ("owner".to_string(), "app".to_string()),
            ("action".to_string(), "delete".to_string()),
        ]);
        assert!(matches_selector(&labels, "owner=app,action=delete"));
        assert!(matches_selector(&labels, "owner"));
        assert!(!matches_selector(&labels, "owner=other"));
        assert!(!matches_selector(&labels, "missing"));
    }
}
