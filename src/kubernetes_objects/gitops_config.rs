use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ownership::OwnerIdentity;

pub(crate) const INITIALIZED_ANNOTATION: &str = "gitopsconfig.gitops.man10.red/initialized";
pub(crate) const FINALIZER: &str = "gitopsconfig.gitops.man10.red/finalizer";
pub(crate) const JOB_OWNER_LABEL: &str = "gitopsconfig.gitops.man10.red/jobOwner";
pub(crate) const ACTION_LABEL: &str = "action";

const DEFAULT_REF: &str = "master";
const DEFAULT_CONTEXT_DIR: &str = ".";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const DEFAULT_RESOURCE_HANDLING_MODE: &str = "Apply";

/// Declarative GitOps deployment: where the manifests live and when to apply them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gitops.man10.red",
    version = "v1alpha1",
    kind = "GitOpsConfig",
    plural = "gitopsconfigs",
    shortname = "gitops",
    namespaced,
    status = "GitOpsConfigStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Started","type":"date","jsonPath":".status.startTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsConfigSpec {
    /// Repository holding the templates to render.
    #[serde(default)]
    pub template_source: GitSource,

    /// Repository holding the parameters. Inherits from `templateSource` where empty.
    #[serde(default)]
    pub parameter_source: GitSource,

    #[serde(default)]
    pub triggers: Vec<GitOpsTrigger>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_ref: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_processor_image: String,

    /// How the processor applies rendered resources (`Apply`, `Create`, `Patch`, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_handling_mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_deletion_mode: Option<ResourceDeletionMode>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,

    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub git_ref: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_dir: String,

    /// Name of a Secret holding Git credentials.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,

    /// Cron schedule, only meaningful for `Periodic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// HMAC secret for payload validation, only meaningful for `Webhook`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TriggerType {
    Change,
    Periodic,
    Webhook,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ResourceDeletionMode {
    Delete,
    Retain,
    None,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum GitOpsState {
    InProgress,
    Success,
    Failure,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsConfigStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<GitOpsState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<Time>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidConfigError {
    #[error("templateSource.uri must not be empty")]
    EmptyTemplateUri,
}

impl GitOpsConfig {
    /// `namespace/name`, used in log lines.
    pub(crate) fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    pub(crate) fn has_trigger(&self, trigger_type: TriggerType) -> bool {
        self.spec
            .triggers
            .iter()
            .any(|t| t.trigger_type == trigger_type)
    }

    /// Schedule of the first Periodic trigger.
    pub(crate) fn periodic_cron(&self) -> Option<&str> {
        self.spec
            .triggers
            .iter()
            .find(|t| t.trigger_type == TriggerType::Periodic)
            .and_then(|t| t.cron.as_deref())
    }

    /// Secret of the first Webhook trigger.
    pub(crate) fn webhook_secret(&self) -> Option<&str> {
        self.spec
            .triggers
            .iter()
            .find(|t| t.trigger_type == TriggerType::Webhook)
            .and_then(|t| t.secret.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.annotations()
            .get(INITIALIZED_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.annotations_mut()
            .insert(INITIALIZED_ANNOTATION.to_string(), "true".to_string());
    }

    pub(crate) fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub(crate) fn finalizer_wanted(&self) -> bool {
        self.spec.resource_deletion_mode != Some(ResourceDeletionMode::Retain)
    }

    /// Adds or removes the finalizer so it matches the deletion mode.
    /// Returns whether the object changed.
    pub(crate) fn sync_finalizer(&mut self) -> bool {
        match (self.finalizer_wanted(), self.has_finalizer()) {
            (true, false) => {
                self.finalizers_mut().push(FINALIZER.to_string());
                true
            }
            (false, true) => {
                self.remove_finalizer();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != FINALIZER);
    }

    /// Fills every unset field with its default. Fails when there is nothing to fetch.
    pub(crate) fn apply_defaults(&mut self) -> Result<(), InvalidConfigError> {
        let spec = &mut self.spec;
        if spec.template_source.uri.is_empty() {
            return Err(InvalidConfigError::EmptyTemplateUri);
        }

        default_string(&mut spec.template_source.git_ref, DEFAULT_REF);
        default_string(&mut spec.template_source.context_dir, DEFAULT_CONTEXT_DIR);

        let template = spec.template_source.clone();
        let parameter = &mut spec.parameter_source;
        default_string(&mut parameter.uri, &template.uri);
        default_string(&mut parameter.git_ref, &template.git_ref);
        default_string(&mut parameter.context_dir, DEFAULT_CONTEXT_DIR);

        default_string(&mut spec.service_account_ref, DEFAULT_SERVICE_ACCOUNT);
        default_string(
            &mut spec.resource_handling_mode,
            DEFAULT_RESOURCE_HANDLING_MODE,
        );
        spec.resource_deletion_mode
            .get_or_insert(ResourceDeletionMode::Delete);
        Ok(())
    }

    pub(crate) fn owner_identity(&self) -> OwnerIdentity {
        OwnerIdentity {
            kind: Self::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid().unwrap_or_default(),
        }
    }
}

fn default_string(field: &mut String, default: &str) {
    if field.is_empty() {
        *field = default.to_string();
    }
}
