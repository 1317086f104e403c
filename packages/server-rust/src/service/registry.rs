use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rpchost_core::{InvokeTarget, MethodDescriptor, ServiceSchema, TracingContext};
use serde_json::Value;

use super::error::PipelineError;
use super::invoke::{InvocationOutcome, ResolvedMethod};
use crate::traits::{Activator, MethodResolver};

/// Boxed future returned by method handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Value>, PipelineError>> + Send>>;

type Handler = Arc<dyn Fn(TracingContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

struct RegisteredMethod {
    resolved: Arc<ResolvedMethod>,
    handler: Handler,
}

// ---------------------------------------------------------------------------
// MethodRegistry
// ---------------------------------------------------------------------------

/// In-memory method table for one hosted service.
///
/// Acts as both resolver and activator. Methods are registered at startup and
/// read concurrently afterwards.
pub struct MethodRegistry {
    service: String,
    version: String,
    methods: DashMap<String, RegisteredMethod>,
    /// Registration order, used for the schema.
    order: RwLock<Vec<String>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            methods: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Registers `handler` for `descriptor`.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor names another service or the method name is
    /// already taken.
    pub fn register<F, Fut>(&self, descriptor: MethodDescriptor, handler: F) -> anyhow::Result<()>
    where
        F: Fn(TracingContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, PipelineError>> + Send + 'static,
    {
        if descriptor.service != self.service {
            anyhow::bail!(
                "method {} does not belong to service {}",
                descriptor.qualified_name(),
                self.service
            );
        }
        let name = descriptor.name.clone();
        if self.methods.contains_key(&name) {
            anyhow::bail!("method {} already registered", descriptor.qualified_name());
        }

        tracing::debug!(method = %descriptor.qualified_name(), "registered method");
        let handler: Handler = Arc::new(move |ctx: TracingContext, args: Vec<Value>| -> HandlerFuture {
            Box::pin(handler(ctx, args))
        });
        self.methods.insert(
            name.clone(),
            RegisteredMethod {
                resolved: Arc::new(ResolvedMethod::new(descriptor)),
                handler,
            },
        );
        self.order.write().push(name);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// The service schema, methods in registration order.
    #[must_use]
    pub fn schema(&self) -> ServiceSchema {
        let methods = self
            .order
            .read()
            .iter()
            .filter_map(|name| {
                self.methods
                    .get(name)
                    .map(|entry| entry.resolved.descriptor.clone())
            })
            .collect();
        ServiceSchema {
            service: self.service.clone(),
            version: self.version.clone(),
            methods,
        }
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("service", &self.service)
            .field("version", &self.version)
            .field("methods", &*self.order.read())
            .finish()
    }
}

#[async_trait]
impl MethodResolver for MethodRegistry {
    async fn resolve(&self, target: &InvokeTarget) -> Result<Arc<ResolvedMethod>, PipelineError> {
        if target.service_name != self.service {
            return Err(PipelineError::not_found(format!(
                "unknown service '{}'",
                target.service_name
            )));
        }
        self.methods
            .get(&target.method_name)
            .map(|entry| Arc::clone(&entry.resolved))
            .ok_or_else(|| PipelineError::not_found(format!("unknown method '{target}'")))
    }
}

#[async_trait]
impl Activator for MethodRegistry {
    async fn invoke(
        &self,
        ctx: TracingContext,
        method: &ResolvedMethod,
        arguments: Vec<Value>,
    ) -> Result<InvocationOutcome, PipelineError> {
        // Clone the handler out so no map guard is held across the await.
        let handler = self
            .methods
            .get(&method.descriptor.name)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| PipelineError::not_found(format!("unknown method '{}'", method.name())))?;

        let start = Instant::now();
        let result = handler(ctx, arguments).await?;
        Ok(InvocationOutcome {
            result,
            execution_time: start.elapsed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
