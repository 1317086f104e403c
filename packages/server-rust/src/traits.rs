use std::sync::Arc;

use async_trait::async_trait;
use rpchost_core::{InvokeTarget, TracingContext};
use serde_json::Value;

use crate::service::config::LoadSheddingPolicy;
use crate::service::error::PipelineError;
use crate::service::events::CompletionEvent;
use crate::service::invoke::{InvocationOutcome, ResolvedMethod};

/// Looks up invocation targets in the service's method table.
/// Implementations: in-memory registry, generated dispatch tables.
#[async_trait]
pub trait MethodResolver: Send + Sync {
    /// Resolve `target` to a callable method.
    ///
    /// Fails with [`PipelineError::NotFound`] for unknown services or methods.
    async fn resolve(&self, target: &InvokeTarget) -> Result<Arc<ResolvedMethod>, PipelineError>;
}

/// Executes resolved methods.
#[async_trait]
pub trait Activator: Send + Sync {
    /// Invoke `method` with the ordered argument list. `ctx` is the request's
    /// own copy of the tracing context.
    async fn invoke(
        &self,
        ctx: TracingContext,
        method: &ResolvedMethod,
        arguments: Vec<Value>,
    ) -> Result<InvocationOutcome, PipelineError>;
}

/// Supplies a fresh load-shedding snapshot for every request.
pub trait PolicySource: Send + Sync {
    fn load_shedding(&self) -> Arc<LoadSheddingPolicy>;
}

/// Receives one completion event per request. Best-effort: never fails and
/// never blocks the request path.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: CompletionEvent);
}
