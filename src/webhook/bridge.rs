use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;
use sha1::Sha1;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::kubernetes_objects::client::{KubeClient, KubeClientError};
use crate::kubernetes_objects::gitops_config::{GitOpsConfig, GitSource, TriggerType};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

const BRANCH_PREFIX: &str = "refs/heads/";

/// The parts of a push notification used for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PushNotification {
    /// `owner/repository`
    pub(crate) repo_full_name: String,
    /// As pushed, e.g. `refs/heads/main` or `refs/tags/v1.0.0`.
    pub(crate) git_ref: String,
}

/// Branch refs are compared by branch name; anything else must match verbatim.
fn ref_matches(configured: &str, pushed: &str) -> bool {
    let pushed = pushed.strip_prefix(BRANCH_PREFIX).unwrap_or(pushed);
    !configured.is_empty() && configured == pushed
}

fn source_matches(source: &GitSource, push: &PushNotification) -> bool {
    !source.uri.is_empty()
        && source.uri.contains(&push.repo_full_name)
        && ref_matches(&source.git_ref, &push.git_ref)
}

pub(crate) fn matches_push(config: &GitOpsConfig, push: &PushNotification) -> bool {
    config.has_trigger(TriggerType::Webhook)
        && (source_matches(&config.spec.template_source, push)
            || source_matches(&config.spec.parameter_source, push))
}

/// Checks a `sha256=<hex>` or `sha1=<hex>` HMAC signature over the raw payload.
pub(crate) fn signature_valid(secret: &str, payload: &[u8], signature: Option<&str>) -> bool {
    let Some((algorithm, hex_digest)) = signature.and_then(|s| s.split_once('=')) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    match algorithm {
        "sha256" => verify::<HmacSha256>(secret, payload, &expected),
        "sha1" => verify::<HmacSha1>(secret, payload, &expected),
        _ => false,
    }
}

fn verify<M: Mac + KeyInit>(secret: &str, payload: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = <M as KeyInit>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(expected).is_ok()
}

/// Turns push notifications into reconcile requests for the matching GitOpsConfigs.
pub(crate) struct WebhookBridge {
    client: Arc<dyn KubeClient>,
    queue: UnboundedSender<ObjectRef<GitOpsConfig>>,
}

impl WebhookBridge {
    pub(crate) fn new(
        client: Arc<dyn KubeClient>,
        queue: UnboundedSender<ObjectRef<GitOpsConfig>>,
    ) -> Self {
        Self { client, queue }
    }

    /// Returns how many GitOpsConfigs were queued.
    #[instrument(
        "webhook_dispatch",
        skip(self, payload, signature),
        fields(repository = %push.repo_full_name, git_ref = %push.git_ref)
    )]
    pub(crate) async fn dispatch(
        &self,
        push: &PushNotification,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<usize, KubeClientError> {
        let configs = self.client.list_gitops_configs().await?;
        let mut queued = 0;

        for config in configs.iter().filter(|c| matches_push(c, push)) {
            if let Some(secret) = config.webhook_secret()
                && !signature_valid(secret, payload, signature)
            {
                warn!(
                    "Push signature does not validate for GitOpsConfig '{}'. Skipping it.",
                    config.key()
                );
                continue;
            }

            let namespace = config.namespace().unwrap_or_default();
            let obj_ref = ObjectRef::new(&config.name_any()).within(&namespace);
            if self.queue.unbounded_send(obj_ref).is_err() {
                warn!("Reconcile queue is closed. Dropping webhook trigger.");
                break;
            }
            info!("Queued GitOpsConfig '{}' after push.", config.key());
            queued += 1;
        }
        Ok(queued)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kubernetes_objects::fake::FakeKubeClient;
    use crate::kubernetes_objects::gitops_config::tests::{sample_config, trigger};
    use futures::StreamExt;
    use futures::channel::mpsc;

    pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub(crate) fn sign_sha1(secret: &str, payload: &[u8]) -> String {
        let mut mac = <HmacSha1 as KeyInit>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn push() -> PushNotification {
        PushNotification {
            repo_full_name: "org/repo".to_string(),
            git_ref: "refs/heads/main".to_string(),
        }
    }

    fn config(name: &str, uri: &str, git_ref: &str, triggers: Vec<TriggerType>) -> GitOpsConfig {
        let mut config = sample_config(name, triggers.into_iter().map(trigger).collect());
        config.spec.template_source.uri = uri.to_string();
        config.spec.template_source.git_ref = git_ref.to_string();
        config
    }

    #[test]
    fn test_matches_only_webhook_triggered_configs() {
        let uri = "https://github.com/org/repo.git";
        assert!(matches_push(&config("a", uri, "main", vec![TriggerType::Webhook]), &push()));
        assert!(!matches_push(&config("b", uri, "main", vec![TriggerType::Change]), &push()));
        assert!(!matches_push(&config("c", uri, "main", vec![]), &push()));
        assert!(!matches_push(&config("d", uri, "develop", vec![TriggerType::Webhook]), &push()));
        assert!(!matches_push(
            &config("e", "https://github.com/org/other", "main", vec![TriggerType::Webhook]),
            &push()
        ));
    }

    #[test]
    fn test_parameter_source_matches_independently() {
        let mut c = config(
            "a",
            "https://github.com/org/templates",
            "master",
            vec![TriggerType::Webhook],
        );
        c.spec.parameter_source.uri = "https://github.com/org/repo".to_string();
        c.spec.parameter_source.git_ref = "main".to_string();

        assert!(matches_push(&c, &push()));
    }

    #[test]
    fn test_tag_refs_match_verbatim() {
        let tag = PushNotification {
            repo_full_name: "org/repo".to_string(),
            git_ref: "refs/tags/v1.0.0".to_string(),
        };
        let uri = "https://github.com/org/repo";
        assert!(matches_push(
            &config("a", uri, "refs/tags/v1.0.0", vec![TriggerType::Webhook]),
            &tag
        ));
        assert!(!matches_push(&config("b", uri, "v1.0.0", vec![TriggerType::Webhook]), &tag));
    }

    #[test]
    fn test_signature_validation() {
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign("s3cret", payload);

        assert!(signature_valid("s3cret", payload, Some(&signature)));
        assert!(!signature_valid("other", payload, Some(&signature)));
        assert!(!signature_valid("s3cret", b"tampered", Some(&signature)));
        assert!(!signature_valid("s3cret", payload, None));
        assert!(!signature_valid("s3cret", payload, Some("md5=abcdef")));
        assert!(!signature_valid("s3cret", payload, Some("sha256")));
        assert!(!signature_valid("s3cret", payload, Some("sha256=not-hex")));
    }

    #[test]
    fn test_sha1_signature_validation() {
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign_sha1("s3cret", payload);

        assert!(signature_valid("s3cret", payload, Some(&signature)));
        assert!(!signature_valid("other", payload, Some(&signature)));
        assert!(!signature_valid("s3cret", b"tampered", Some(&signature)));
        assert!(!signature_valid("s3cret", payload, Some("sha1=abcdef")));
    }

    #[tokio::test]
    async fn test_dispatch_queues_validated_matches_only() {
        let client = Arc::new(FakeKubeClient::default());
        let uri = "https://github.com/org/repo";
        client.insert_config(config("open", uri, "main", vec![TriggerType::Webhook]));
        let mut guarded = config("guarded", uri, "main", vec![TriggerType::Webhook]);
        guarded.spec.triggers[0].secret = Some("s3cret".to_string());
        client.insert_config(guarded);
        let mut wrong_secret = config("wrong", uri, "main", vec![TriggerType::Webhook]);
        wrong_secret.spec.triggers[0].secret = Some("nope".to_string());
        client.insert_config(wrong_secret);
        client.insert_config(config("change", uri, "main", vec![TriggerType::Change]));

        let (tx, mut rx) = mpsc::unbounded();
        let bridge = WebhookBridge::new(client, tx);
        let payload = b"{}";

        let queued = bridge
            .dispatch(&push(), payload, Some(&sign("s3cret", payload)))
            .await
            .unwrap();

        assert_eq!(queued, 2);
        drop(bridge);
        let names: Vec<String> = rx.by_ref().map(|r| r.name).collect().await;
        assert_eq!(names, vec!["guarded".to_string(), "open".to_string()]);
    }
}
