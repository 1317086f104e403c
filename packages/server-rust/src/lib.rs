//! `rpchost` Server — inbound edge of an RPC service host: accept loop,
//! per-request pipeline, admission control and failure classification.

pub mod network;
pub mod observability;
pub mod service;
pub mod traits;

pub use traits::{Activator, EventPublisher, MethodResolver, PolicySource};
