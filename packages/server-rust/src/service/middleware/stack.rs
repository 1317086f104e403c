//! Invocation stack composition.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::activation::ActivationService;
use super::metrics::{MetricsLayer, MetricsService};
use crate::traits::Activator;

/// The composed invocation service. Cheap to clone; each request drives its
/// own clone.
pub type InvocationStack = MetricsService<ActivationService>;

/// Builds the invocation stack around `activator`.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer`: span and duration histogram per method
/// 2. `ActivationService`: argument list, then the activator call
#[must_use]
pub fn build_invocation_stack(activator: Arc<dyn Activator>) -> InvocationStack {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .service(ActivationService::new(activator))
}
