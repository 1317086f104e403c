//! HTTP middleware stack in front of the ingress handler.
//!
//! Layers are listed outermost first. These are transport concerns only;
//! admission control and invocation timing happen in the request pipeline.

use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// The composed layer type produced by [`build_http_layers`].
type HttpLayers = Stack<
    TimeoutLayer,
    Stack<RequestBodyLimitLayer, Stack<TraceLayer<SharedClassifier<ServerErrorsAsFailures>>, Identity>>,
>;

/// Builds the transport middleware:
///
/// 1. `Trace`: one span per HTTP request
/// 2. `RequestBodyLimit`: answers 413 for bodies over `body_limit`
/// 3. `Timeout`: answers 408 once `request_timeout` elapses
///
/// The body limit sits outside the timeout: `TimeoutLayer` builds its 408
/// from `Default` on the inner response body, which the limited body type
/// does not implement.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.body_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .into_inner()
}
