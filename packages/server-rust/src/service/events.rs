//! Completion events: one per request that reached the RPC pipeline.
//!
//! Publishing is fire-and-forget. [`ChannelEventPublisher`] hands events to a
//! background task through a bounded queue and drops them when the queue is
//! full, so a slow sink never delays responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use rpchost_core::IncomingRequest;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::PipelineError;
use super::invoke::ResolvedMethod;
use crate::traits::EventPublisher;

/// What happened to one request.
#[derive(Debug)]
pub struct CompletionEvent {
    /// Request id assigned during parsing; `None` if parsing never ran.
    pub request_id: Option<String>,
    /// The decoded request, if decoding succeeded.
    pub request: Option<IncomingRequest>,
    /// The failure as raised, before classification.
    pub error: Option<PipelineError>,
    /// The resolved method, if resolution succeeded.
    pub method: Option<Arc<ResolvedMethod>>,
    /// Status written to the client.
    pub status: StatusCode,
    /// Time from the pipeline taking the request to the response being written.
    pub elapsed: Duration,
}

impl CompletionEvent {
    #[must_use]
    pub fn method_name(&self) -> Option<String> {
        self.method.as_ref().map(|m| m.name())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// TracingEventPublisher
// ---------------------------------------------------------------------------

/// Writes every completion event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: CompletionEvent) {
        let method = event.method_name().unwrap_or_default();
        let request_id = event.request_id.as_deref().unwrap_or_default();
        let elapsed_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX);
        match &event.error {
            None => tracing::info!(
                request_id,
                method,
                status = event.status.as_u16(),
                elapsed_ms,
                "request completed"
            ),
            Some(error) => tracing::warn!(
                request_id,
                method,
                status = event.status.as_u16(),
                elapsed_ms,
                kind = ?error.root_cause().kind(),
                error = %error,
                "request failed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Destination drained by the background task of [`ChannelEventPublisher`].
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn write(&mut self, event: CompletionEvent);

    /// Called on every flush tick and once on shutdown. Default is a no-op.
    async fn flush(&mut self) {}
}

// ---------------------------------------------------------------------------
// ChannelEventPublisher
// ---------------------------------------------------------------------------

/// Publishes into a bounded queue drained by a background task.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::Sender<CompletionEvent>,
}

/// Handle to the background task behind a [`ChannelEventPublisher`].
#[derive(Debug)]
pub struct EventPump {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelEventPublisher {
    /// Spawns the background task draining into `sink`.
    ///
    /// The sink is flushed every `flush_interval` and once more when the pump
    /// stops.
    pub fn start<S: EventSink>(
        mut sink: S,
        capacity: usize,
        flush_interval: Duration,
    ) -> (Self, EventPump) {
        let (tx, mut rx) = mpsc::channel::<CompletionEvent>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(flush_interval);
            // The first tick fires immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => sink.write(event).await,
                        None => break,
                    },
                    _ = ticks.tick() => sink.flush().await,
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            sink.write(event).await;
                        }
                        break;
                    }
                }
            }

            sink.flush().await;
        });

        (
            Self { tx },
            EventPump {
                shutdown_tx: Some(shutdown_tx),
                handle: Some(handle),
            },
        )
    }
}

impl EventPublisher for ChannelEventPublisher {
    fn publish(&self, event: CompletionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::counter!("rpc_events_dropped_total").increment(1);
                tracing::warn!(
                    request_id = event.request_id.as_deref().unwrap_or_default(),
                    "event queue full; dropping completion event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event pump stopped; dropping completion event");
            }
        }
    }
}

impl EventPump {
    /// Stops the background task after writing every queued event.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "event pump task failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
