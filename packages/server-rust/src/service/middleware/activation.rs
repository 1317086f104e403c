//! Innermost invocation service: argument building and activation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use crate::service::error::PipelineError;
use crate::service::invoke::{build_arguments, Invocation, InvocationOutcome};
use crate::traits::Activator;

/// Turns an [`Invocation`] into an activator call.
#[derive(Clone)]
pub struct ActivationService {
    activator: Arc<dyn Activator>,
}

impl ActivationService {
    #[must_use]
    pub fn new(activator: Arc<dyn Activator>) -> Self {
        Self { activator }
    }
}

impl std::fmt::Debug for ActivationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationService").finish_non_exhaustive()
    }
}

impl Service<Invocation> for ActivationService {
    type Response = InvocationOutcome;
    type Error = PipelineError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutcome, PipelineError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let activator = Arc::clone(&self.activator);
        Box::pin(async move {
            let arguments = build_arguments(
                &invocation.method.descriptor,
                &invocation.arguments,
                invocation.weakly_typed,
            )?;
            activator
                .invoke(invocation.ctx, &invocation.method, arguments)
                .await
        })
    }
}
