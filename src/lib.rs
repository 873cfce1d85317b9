use std::sync::Arc;

use self::cli::{Cli, Command};
use self::config::Config;
use self::job_watch::{default_handlers, run_job_watch};
use self::kubernetes_objects::client::{KubeClient, KubeClientImpl};
use self::kubernetes_objects::events::KubeEventPublisher;
use self::kubernetes_objects::gitops_config::GitOpsConfig;
use self::kubernetes_objects::renderer::{RenderError, TemplateRenderer};
use self::reconciler::{CONTROLLER_NAME, Context, run_controller};
use self::shutdown::Shutdown;
use self::webhook::WebhookBridge;
use clap::Parser;
use futures::channel::mpsc;
use futures::{FutureExt, TryFutureExt};
use kube::CustomResourceExt;
use thiserror::Error;
use tracing::{error, info};
use tracing_error::ExtractSpanTrace;
use tracing_error::SpanTrace;

pub mod cli;
pub mod config;
pub mod error;
pub(crate) mod job_watch;
pub mod kubernetes_objects;
pub(crate) mod reconciler;
pub mod shutdown;
pub(crate) mod webhook;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to load config.\n{0}")]
    ConfigError(#[from] config::ConfigLoadError),

    #[error("Failed to initialize kubernetes client.\n{0}")]
    KubeClientError(#[from] kube::Error),

    #[error("Failed to load manifest templates.\n{0}")]
    TemplateError(#[from] RenderError),

    #[error("Webhook ingress failed.\n{0}")]
    WebhookError(#[from] std::io::Error),

    #[error("Failed to serialize CustomResourceDefinition.\n{0}")]
    CrdError(#[from] serde_yaml::Error),
}

impl ExtractSpanTrace for AppError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            AppError::TemplateError(e) => e.span_trace(),
            _ => None,
        }
    }
}

pub async fn app() -> Result<(), AppError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Crd {} => {
            print!("{}", serde_yaml::to_string(&GitOpsConfig::crd())?);
            Ok(())
        }
        Command::Run {} => {
            let config = Config::new_from_file(&cli.config).await?;
            info!("Config Loaded.");
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let client = kube::Client::try_default().await?;

    info!("Kubernetes Client Initialized.");

    let renderer = TemplateRenderer::from_paths(
        config.templates.job.as_deref(),
        config.templates.cronjob.as_deref(),
        config.templates.processor_image.clone(),
    )
    .await?;
    let kube_client: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(
        client.clone(),
        config.watch_namespace.clone(),
        config.field_manager.clone(),
    ));
    let publisher = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let ctx = Arc::new(Context::new(
        kube_client.clone(),
        Arc::new(renderer),
        config.controller.clone(),
    ));

    // Bind before starting anything so a bad listen address fails fast.
    let listener = match &config.webhook {
        Some(webhook) => Some(webhook::bind(webhook.listen).await?),
        None => None,
    };

    let shutdown = Shutdown::new();
    let (webhook_tx, webhook_rx) = mpsc::unbounded();
    let namespace = config.watch_namespace.as_deref();

    let controller = run_controller(client.clone(), namespace, ctx, webhook_rx);
    let job_watch = run_job_watch(
        client,
        namespace,
        default_handlers(kube_client.clone(), publisher),
        shutdown.clone(),
    );
    let ingress = async move {
        match listener {
            Some(listener) => {
                let bridge = Arc::new(WebhookBridge::new(kube_client, webhook_tx));
                webhook::serve(listener, bridge, shutdown).await
            }
            None => {
                // Keep the reconcile trigger stream open for the controller's lifetime.
                let _webhook_tx = webhook_tx;
                let mut shutdown = shutdown;
                shutdown.wait().await;
                Ok(())
            }
        }
    };

    supervise(controller, job_watch, ingress).await?;

    info!("Shut down cleanly.");
    Ok(())
}

/// Waits for all three to stop, or returns as soon as the webhook ingress fails.
async fn supervise(
    controller: impl Future<Output = ()>,
    job_watch: impl Future<Output = ()>,
    ingress: impl Future<Output = Result<(), std::io::Error>>,
) -> Result<(), std::io::Error> {
    let ingress = ingress.inspect_err(|e| error!("Webhook ingress failed: {e}"));
    tokio::try_join!(
        controller.map(Ok::<(), std::io::Error>),
        job_watch.map(Ok::<(), std::io::Error>),
        ingress,
    )?;
    Ok(())
}
