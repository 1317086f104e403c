//! Custom endpoints that may claim a request before the RPC pipeline runs.
//!
//! Endpoints exist for infrastructure traffic (health checks, schema discovery).
//! A claimed request is not validated, admission-checked, measured or
//! published as an RPC call.

use std::sync::Arc;

use async_trait::async_trait;

use super::classify::error_response;
use super::error::PipelineError;
use crate::network::{RequestHead, RpcResponse};

/// A handler that may claim a request.
#[async_trait]
pub trait CustomEndpoint: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Returns `Some(response)` to claim the request, `None` to pass.
    ///
    /// An error also claims the request; it is classified and written as the
    /// response.
    async fn try_handle(&self, head: &RequestHead) -> Result<Option<RpcResponse>, PipelineError>;
}

/// Result of running the chain.
#[derive(Debug)]
pub enum EndpointOutcome {
    Claimed(RpcResponse),
    Pass,
}

/// Ordered endpoints; the first claim wins.
#[derive(Clone, Default)]
pub struct CustomEndpointChain {
    endpoints: Vec<Arc<dyn CustomEndpoint>>,
}

impl CustomEndpointChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, endpoint: impl CustomEndpoint + 'static) -> Self {
        self.endpoints.push(Arc::new(endpoint));
        self
    }

    pub fn push(&mut self, endpoint: Arc<dyn CustomEndpoint>) {
        self.endpoints.push(endpoint);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub async fn try_handle(&self, head: &RequestHead) -> EndpointOutcome {
        for endpoint in &self.endpoints {
            match endpoint.try_handle(head).await {
                Ok(Some(response)) => {
                    tracing::debug!(endpoint = endpoint.name(), path = head.path(), "claimed");
                    return EndpointOutcome::Claimed(response);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        endpoint = endpoint.name(),
                        path = head.path(),
                        error = %error,
                        "custom endpoint failed"
                    );
                    return EndpointOutcome::Claimed(error_response(&error));
                }
            }
        }
        EndpointOutcome::Pass
    }
}

impl std::fmt::Debug for CustomEndpointChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.endpoints.iter().map(|e| e.name()))
            .finish()
    }
}
