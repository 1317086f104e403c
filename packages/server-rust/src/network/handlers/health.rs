//! Health, liveness, and readiness endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::json;

use super::is_get;
use crate::network::{HealthState, RequestHead, RpcResponse, ShutdownController};
use crate::service::endpoint::CustomEndpoint;
use crate::service::error::PipelineError;

pub const LIVENESS_PATH: &str = "/health/live";
pub const READINESS_PATH: &str = "/health/ready";
pub const HEALTH_PATH: &str = "/health";

/// Liveness check: always 200 while the process can answer at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessEndpoint;

#[async_trait]
impl CustomEndpoint for LivenessEndpoint {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn try_handle(&self, head: &RequestHead) -> Result<Option<RpcResponse>, PipelineError> {
        Ok(is_get(head, LIVENESS_PATH).then(|| RpcResponse::empty(StatusCode::OK)))
    }
}

/// Readiness check: 200 when ready, 503 while starting or draining.
#[derive(Debug, Clone)]
pub struct ReadinessEndpoint {
    shutdown: Arc<ShutdownController>,
}

impl ReadinessEndpoint {
    #[must_use]
    pub fn new(shutdown: Arc<ShutdownController>) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl CustomEndpoint for ReadinessEndpoint {
    fn name(&self) -> &'static str {
        "readiness"
    }

    async fn try_handle(&self, head: &RequestHead) -> Result<Option<RpcResponse>, PipelineError> {
        if !is_get(head, READINESS_PATH) {
            return Ok(None);
        }
        let status = if self.shutdown.health_state() == HealthState::Ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Ok(Some(RpcResponse::empty(status)))
    }
}

/// Detailed health as JSON. Always 200; the `state` field carries the verdict
/// so monitors can tell "up but draining" from "down".
#[derive(Debug, Clone)]
pub struct HealthEndpoint {
    shutdown: Arc<ShutdownController>,
}

impl HealthEndpoint {
    #[must_use]
    pub fn new(shutdown: Arc<ShutdownController>) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl CustomEndpoint for HealthEndpoint {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn try_handle(&self, head: &RequestHead) -> Result<Option<RpcResponse>, PipelineError> {
        if !is_get(head, HEALTH_PATH) {
            return Ok(None);
        }
        let body = json!({
            "state": self.shutdown.health_state().as_str(),
            "inFlight": self.shutdown.in_flight_count(),
            "uptimeSecs": self.shutdown.uptime().as_secs(),
        });
        let body = serde_json::to_vec(&body).map_err(anyhow::Error::from)?;
        Ok(Some(RpcResponse::json(StatusCode::OK, body)))
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, Uri};

    use super::*;

    fn get(path: &'static str) -> RequestHead {
        RequestHead::new(Method::GET, Uri::from_static(path))
    }

    fn body(response: &RpcResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let response = LivenessEndpoint.try_handle(&get("/health/live")).await.unwrap();
        assert_eq!(response.unwrap().status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_endpoints_ignore_other_paths_and_methods() {
        assert!(LivenessEndpoint.try_handle(&get("/")).await.unwrap().is_none());
        let post = RequestHead::new(Method::POST, Uri::from_static("/health/live"));
        assert!(LivenessEndpoint.try_handle(&post).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readiness_follows_health_state() {
        let shutdown = Arc::new(ShutdownController::new());
        let endpoint = ReadinessEndpoint::new(Arc::clone(&shutdown));
        let status = |r: Option<RpcResponse>| r.unwrap().status;

        assert_eq!(
            status(endpoint.try_handle(&get("/health/ready")).await.unwrap()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        shutdown.set_ready();
        assert_eq!(
            status(endpoint.try_handle(&get("/health/ready")).await.unwrap()),
            StatusCode::OK
        );
        shutdown.trigger_shutdown();
        assert_eq!(
            status(endpoint.try_handle(&get("/health/ready")).await.unwrap()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn health_reports_state_and_in_flight() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let _guard = shutdown.in_flight_guard();

        let response = HealthEndpoint::new(shutdown)
            .try_handle(&get("/health"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let json = body(&response);
        assert_eq!(json["state"], "ready");
        assert_eq!(json["inFlight"], 1);
        assert!(json["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining_with_ok_status() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.trigger_shutdown();
        let response = HealthEndpoint::new(shutdown)
            .try_handle(&get("/health"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body(&response)["state"], "draining");
    }
}
