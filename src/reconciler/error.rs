use thiserror::Error;
use tracing_error::{ExtractSpanTrace, SpanTrace};

use crate::kubernetes_objects::client::KubeClientError;
use crate::kubernetes_objects::renderer::RenderError;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes client error: {0}")]
    KubeClient(#[from] KubeClientError),

    #[error("Failed to render manifest for GitOpsConfig '{0}': {1}")]
    Render(String, RenderError),

    #[error("GitOpsConfig '{0}' has no uid yet and cannot own objects")]
    MissingUid(String, SpanTrace),
}

impl ExtractSpanTrace for ReconcileError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            ReconcileError::KubeClient(e) => e.span_trace(),
            ReconcileError::Render(_, e) => e.span_trace(),
            ReconcileError::MissingUid(_, s) => Some(s),
        }
    }
}
