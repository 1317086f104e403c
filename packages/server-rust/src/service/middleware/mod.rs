//! Tower middleware for method invocation.
//!
//! - [`metrics`]: invocation span and duration histogram
//! - [`activation`]: builds the argument list and calls the activator
//! - [`stack`]: composes the layers into the invocation stack

pub mod activation;
pub mod metrics;
pub mod stack;

pub use activation::ActivationService;
pub use metrics::MetricsLayer;
pub use stack::{build_invocation_stack, InvocationStack};
