//! Custom endpoints the host ships for orchestrators and tooling.
//!
//! They run ahead of the RPC pipeline through
//! [`CustomEndpointChain`](crate::service::endpoint::CustomEndpointChain), so
//! health-check traffic never counts as an RPC call.

pub mod health;
pub mod schema;

pub use health::{HealthEndpoint, LivenessEndpoint, ReadinessEndpoint};
pub use schema::SchemaEndpoint;

use http::Method;

use crate::network::RequestHead;

/// Whether `head` is a `GET` (or `HEAD`) for exactly `path`.
fn is_get(head: &RequestHead, path: &str) -> bool {
    (head.method == Method::GET || head.method == Method::HEAD) && head.path() == path
}
