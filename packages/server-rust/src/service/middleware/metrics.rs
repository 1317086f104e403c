//! Invocation metrics: one tracing span and one histogram sample per call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::error::PipelineError;
use crate::service::invoke::{Invocation, InvocationOutcome};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Records invocation duration keyed by method name.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = InvocationOutcome, Error = PipelineError> + Send,
    S::Future: Send + 'static,
{
    type Response = InvocationOutcome;
    type Error = PipelineError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutcome, PipelineError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let method = invocation.method.name();
        let span = info_span!(
            "invocation",
            method = %method,
            request_id = invocation.ctx.request_id().unwrap_or_default(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = if result.is_ok() { "ok" } else { "error" };
                let span = tracing::Span::current();
                span.record(
                    "duration_ms",
                    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                );
                span.record("outcome", outcome);

                metrics::histogram!("rpc_invocation_duration_seconds", "method" => method)
                    .record(elapsed.as_secs_f64());
                tracing::debug!(outcome, "invocation complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
