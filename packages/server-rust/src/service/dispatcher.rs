//! Accept loop: one worker task per accepted connection.

use std::future::Future;
use std::sync::Arc;

use rpchost_core::TracingContext;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use super::pipeline::RequestPipeline;
use crate::network::{AcceptError, Listener, ShutdownController};

/// Spawns `task` with a fork of `ctx`.
///
/// The child sees every value `ctx` holds at the time of the call; anything
/// either side sets afterwards stays private to that side.
pub fn spawn_forked<F, Fut>(ctx: &TracingContext, task: F) -> JoinHandle<Fut::Output>
where
    F: FnOnce(TracingContext) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    tokio::spawn(task(ctx.fork()).in_current_span())
}

/// Pulls connections from a [`Listener`] and hands each to its own worker.
///
/// Each worker starts from a fresh, detached [`TracingContext`], so no
/// request ever observes another request's values.
pub struct RequestDispatcher<L> {
    listener: L,
    pipeline: Arc<RequestPipeline>,
    shutdown: Arc<ShutdownController>,
}

impl<L: Listener> RequestDispatcher<L> {
    #[must_use]
    pub fn new(listener: L, pipeline: Arc<RequestPipeline>, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            listener,
            pipeline,
            shutdown,
        }
    }

    /// Runs until the listener stops, then waits for every worker.
    ///
    /// Transient accept failures are logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Returns the fatal accept error that ended the loop.
    pub async fn run(mut self) -> Result<(), AcceptError> {
        let mut workers = JoinSet::new();

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        let pipeline = Arc::clone(&self.pipeline);
                        let guard = self.shutdown.in_flight_guard();
                        workers.spawn(async move {
                            let _guard = guard;
                            pipeline.handle(conn, TracingContext::detached()).await
                        });
                    }
                    Err(AcceptError::Stopped) => {
                        tracing::debug!("listener stopped");
                        break Ok(());
                    }
                    Err(AcceptError::Transient(e)) => {
                        metrics::counter!("rpc_accept_errors_total", "kind" => "transient")
                            .increment(1);
                        tracing::warn!(error = %e, "accept failed; continuing");
                    }
                    Err(e @ AcceptError::Fatal(_)) => {
                        metrics::counter!("rpc_accept_errors_total", "kind" => "fatal")
                            .increment(1);
                        tracing::error!(error = %e, "accept failed; stopping dispatcher");
                        break Err(e);
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
            }
        };

        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
        result
    }
}

fn log_worker_exit<T>(joined: Result<T, tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "request worker panicked");
    }
}

impl<L> std::fmt::Debug for RequestDispatcher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("pipeline", &self.pipeline)
            .field("in_flight", &self.shutdown.in_flight_count())
            .finish_non_exhaustive()
    }
}
