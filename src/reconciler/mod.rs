mod backoff;
mod deletion;
pub mod error;
mod generation_filter;
pub(crate) mod job_orchestrator;
mod reconcile;

use std::sync::Arc;

use derive_debug::Dbg;
use futures::channel::mpsc::UnboundedReceiver;
use futures::{StreamExt, future};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{Instrument, debug, info, info_span, warn};
use tracing_error::ExtractSpanTrace;

use crate::config::controller::ControllerConfig;
use crate::kubernetes_objects::client::KubeClient;
use crate::kubernetes_objects::gitops_config::GitOpsConfig;
use crate::kubernetes_objects::renderer::ManifestRenderer;

use self::backoff::ErrorBackoff;
use self::error::ReconcileError;
use self::generation_filter::GenerationFilter;

pub(crate) const CONTROLLER_NAME: &str = "gitopsconfig-controller";

/// Shared by every reconcile. Holds no per-object state besides the error backoff.
#[derive(Dbg)]
pub(crate) struct Context {
    #[dbg(skip)]
    pub(crate) client: Arc<dyn KubeClient>,
    #[dbg(skip)]
    pub(crate) renderer: Arc<dyn ManifestRenderer>,
    pub(crate) settings: ControllerConfig,
    backoff: ErrorBackoff,
}

impl Context {
    pub(crate) fn new(
        client: Arc<dyn KubeClient>,
        renderer: Arc<dyn ManifestRenderer>,
        settings: ControllerConfig,
    ) -> Self {
        let backoff = ErrorBackoff::new(settings.error_backoff_base, settings.error_backoff_max);
        Self {
            client,
            renderer,
            settings,
            backoff,
        }
    }
}

async fn reconcile(
    config: Arc<GitOpsConfig>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let key = config.key();

    let result = ctx
        .reconcile_config(&namespace, &name)
        .instrument(info_span!(
            "reconcile",
            kubernetes_namespace = %namespace,
            gitops_config_name = %name
        ))
        .await;
    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

fn print_span_trace(err: &ReconcileError) {
    if let Some(span_trace) = err.span_trace() {
        eprintln!("\n{}\n", color_spantrace::colorize(span_trace));
    }
}

fn error_policy(config: Arc<GitOpsConfig>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = config.key();
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        "Reconcile of GitOpsConfig '{}' failed: {}. Retrying in {}ms...",
        key,
        err,
        delay.as_millis()
    );
    print_span_trace(err);
    Action::requeue(delay)
}

/// The controller never reconciles an object again once it left the cluster, so its
/// failure count is dropped here instead.
fn forget_deleted(
    backoff: &ErrorBackoff,
    event: &Result<watcher::Event<GitOpsConfig>, watcher::Error>,
) {
    if let Ok(watcher::Event::Delete(config)) = event {
        backoff.reset(&config.key());
    }
}

/// Runs the GitOpsConfig controller until SIGINT/SIGTERM.
///
/// Reconciles are triggered by spec generation changes and by references pushed
/// through `webhook_events`. Status-only updates are not observed.
pub(crate) async fn run_controller(
    client: Client,
    watch_namespace: Option<&str>,
    ctx: Arc<Context>,
    webhook_events: UnboundedReceiver<ObjectRef<GitOpsConfig>>,
) {
    let api: Api<GitOpsConfig> = match watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let (reader, writer) = reflector::store();

    let mut generations = GenerationFilter::default();
    let deletions = ctx.clone();
    let trigger = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .inspect(move |event| forget_deleted(&deletions.backoff, event))
        .filter_map(move |event| future::ready(generations.filter_event(event)));

    let config = controller::Config::default().concurrency(ctx.settings.concurrency);

    info!(
        "Starting GitOpsConfig controller with {} workers...",
        ctx.settings.concurrency
    );
    Controller::for_stream(trigger, reader)
        .with_config(config)
        .reconcile_on(webhook_events)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("Reconciled GitOpsConfig '{}'.", obj),
                Err(e) => debug!("Reconcile loop reported: {}", e),
            }
        })
        .await;
    info!("GitOpsConfig controller stopped.");
}
