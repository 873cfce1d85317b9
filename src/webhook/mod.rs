//! HTTP ingress for GitHub push notifications.

mod bridge;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

pub(crate) use bridge::{PushNotification, WebhookBridge};

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Deserialize, Debug)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
}

#[derive(Deserialize, Debug)]
struct Repository {
    full_name: String,
}

type Reply = (StatusCode, String);

pub(crate) fn routes(bridge: Arc<WebhookBridge>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(bridge)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_webhook(
    State(bridge): State<Arc<WebhookBridge>>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let Some(event) = header(&headers, EVENT_HEADER) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing X-GitHub-Event header".to_string(),
        );
    };

    match event {
        "ping" => (StatusCode::OK, "pong".to_string()),
        "push" => handle_push(&bridge, &headers, &body).await,
        other => {
            debug!("Ignoring GitHub event '{other}'.");
            (StatusCode::ACCEPTED, format!("event '{other}' ignored"))
        }
    }
}

async fn handle_push(bridge: &WebhookBridge, headers: &HeaderMap, body: &[u8]) -> Reply {
    let payload: PushPayload = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Malformed push payload: {e}");
            return (StatusCode::BAD_REQUEST, format!("malformed push payload: {e}"));
        }
    };
    let push = PushNotification {
        repo_full_name: payload.repository.full_name,
        git_ref: payload.git_ref,
    };
    let signature =
        header(headers, SIGNATURE_256_HEADER).or_else(|| header(headers, SIGNATURE_HEADER));

    match bridge.dispatch(&push, body, signature).await {
        Ok(queued) => (StatusCode::OK, format!("queued {queued} GitOpsConfig(s)")),
        Err(e) => {
            error!("Failed to list GitOpsConfigs for push: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to list GitOpsConfigs".to_string(),
            )
        }
    }
}

pub(crate) async fn bind(listen: SocketAddr) -> Result<TcpListener, std::io::Error> {
    let listener = TcpListener::bind(listen).await?;
    info!("Webhook listening on {listen}");
    Ok(listener)
}

/// Serves the webhook endpoint until shutdown is requested.
pub(crate) async fn serve(
    listener: TcpListener,
    bridge: Arc<WebhookBridge>,
    mut shutdown: Shutdown,
) -> Result<(), std::io::Error> {
    axum::serve(listener, routes(bridge))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    info!("Webhook stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bridge::tests::{sign, sign_sha1};
    use super::*;
    use crate::kubernetes_objects::fake::FakeKubeClient;
    use crate::kubernetes_objects::gitops_config::TriggerType;
    use crate::kubernetes_objects::gitops_config::tests::{sample_config, trigger};
    use axum::body::Body;
    use axum::http::Request;
    use futures::channel::mpsc::{self, UnboundedReceiver};
    use futures::{FutureExt, StreamExt};
    use kube::runtime::reflector::ObjectRef;
    use tower::ServiceExt;

    use crate::kubernetes_objects::gitops_config::GitOpsConfig;

    const PUSH: &str =
        r#"{"ref":"refs/heads/main","repository":{"full_name":"man10/manifests"}}"#;

    fn router(
        client: Arc<FakeKubeClient>,
    ) -> (Router, UnboundedReceiver<ObjectRef<GitOpsConfig>>) {
        let (tx, rx) = mpsc::unbounded();
        (routes(Arc::new(WebhookBridge::new(client, tx))), rx)
    }

    fn request(event: Option<&str>, signature: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/webhook");
        if let Some(event) = event {
            builder = builder.header("X-GitHub-Event", event);
        }
        if let Some(signature) = signature {
            builder = builder.header("X-Hub-Signature-256", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn webhook_config(name: &str, secret: Option<&str>) -> GitOpsConfig {
        let mut config = sample_config(name, vec![trigger(TriggerType::Webhook)]);
        config.spec.template_source.git_ref = "main".to_string();
        config.spec.triggers[0].secret = secret.map(str::to_string);
        config
    }

    #[tokio::test]
    async fn test_ping_is_acknowledged() {
        let (app, _rx) = router(Arc::new(FakeKubeClient::default()));

        let response = app.oneshot(request(Some("ping"), None, "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_events_are_accepted_and_ignored() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", None));
        let (app, mut rx) = router(client);

        let response = app
            .oneshot(request(Some("pull_request"), None, PUSH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.next().now_or_never().flatten().is_none());
    }

    #[tokio::test]
    async fn test_missing_event_header_is_rejected() {
        let (app, _rx) = router(Arc::new(FakeKubeClient::default()));

        let response = app.oneshot(request(None, None, PUSH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_push_is_rejected() {
        let (app, _rx) = router(Arc::new(FakeKubeClient::default()));

        let response = app
            .oneshot(request(Some("push"), None, r#"{"ref": 1}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_queues_matching_config() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", None));
        let (app, mut rx) = router(client);

        let response = app.oneshot(request(Some("push"), None, PUSH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let queued = rx.next().now_or_never().flatten().unwrap();
        assert_eq!(queued, ObjectRef::new("app").within("default"));
    }

    #[tokio::test]
    async fn test_push_with_bad_signature_is_not_queued() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", Some("s3cret")));
        let (app, mut rx) = router(client);
        let signature = sign("wrong", PUSH.as_bytes());

        let response = app
            .oneshot(request(Some("push"), Some(&signature), PUSH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.next().now_or_never().flatten().is_none());
    }

    #[tokio::test]
    async fn test_push_with_valid_signature_is_queued() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", Some("s3cret")));
        let (app, mut rx) = router(client);
        let signature = sign("s3cret", PUSH.as_bytes());

        let response = app
            .oneshot(request(Some("push"), Some(&signature), PUSH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.next().now_or_never().flatten().is_some());
    }

    #[tokio::test]
    async fn test_push_with_only_sha1_signature_is_queued() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", Some("s3cret")));
        let (app, mut rx) = router(client);
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-GitHub-Event", "push")
            .header("X-Hub-Signature", sign_sha1("s3cret", PUSH.as_bytes()))
            .body(Body::from(PUSH))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.next().now_or_never().flatten().is_some());
    }

    #[tokio::test]
    async fn test_sha256_header_takes_precedence() {
        let client = Arc::new(FakeKubeClient::default());
        client.insert_config(webhook_config("app", Some("s3cret")));
        let (app, mut rx) = router(client);
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-GitHub-Event", "push")
            .header("X-Hub-Signature-256", sign("wrong", PUSH.as_bytes()))
            .header("X-Hub-Signature", sign_sha1("s3cret", PUSH.as_bytes()))
            .body(Body::from(PUSH))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.next().now_or_never().flatten().is_none());
    }
}
