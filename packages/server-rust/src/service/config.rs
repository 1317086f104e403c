use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rpchost_core::protocol::PROTOCOL_VERSION;

use crate::traits::PolicySource;

/// Server-level configuration for the request pipeline.
///
/// Read-only after startup. Load-shedding settings live in [`LiveConfig`]
/// because they must reflect changes without a restart.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Protocol version string requests must match.
    pub protocol_version: String,
    /// Name of the hosted service.
    pub service_name: String,
    /// Version of the hosted service, echoed in responses.
    pub service_version: String,
    /// Hostname echoed in responses.
    pub hostname: String,
    /// Data center / zone echoed in responses.
    pub data_center: String,
    /// Deployment environment echoed in responses.
    pub environment: String,
    /// Transport security the service requires.
    pub security: TransportSecurity,
    /// Hex SHA-256 fingerprint of the root certificate client chains must end in.
    pub root_fingerprint: Option<String>,
    /// Capacity of the completion event queue.
    pub event_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            service_name: "service".to_string(),
            service_version: "0.0.0".to_string(),
            hostname: "localhost".to_string(),
            data_center: "local".to_string(),
            environment: "dev".to_string(),
            security: TransportSecurity::Insecure,
            root_fingerprint: None,
            event_queue_capacity: 1024,
        }
    }
}

/// The transport security a service declares. Connections must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportSecurity {
    Secure,
    Insecure,
}

// ---------------------------------------------------------------------------
// Load shedding
// ---------------------------------------------------------------------------

/// Behavior of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ShedMode {
    Disabled,
    /// Record a warning and serve the request anyway.
    LogOnly,
    /// Reject the request with `Overloaded`.
    Drop,
}

impl ShedMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ShedMode::Disabled => "disabled",
            ShedMode::LogOnly => "log_only",
            ShedMode::Drop => "drop",
        }
    }
}

/// Snapshot of the admission-control settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSheddingPolicy {
    /// Span-age check: compares the caller's send time with now.
    pub span_age_mode: ShedMode,
    /// Largest accepted delay between the caller sending and us starting.
    pub max_span_age: Duration,
    /// Death-time check: compares the outermost deadline with now.
    pub death_time_mode: ShedMode,
    /// Requests are shed this long before the outermost deadline.
    pub death_time_safety_margin: Duration,
}

impl Default for LoadSheddingPolicy {
    fn default() -> Self {
        Self {
            span_age_mode: ShedMode::Disabled,
            max_span_age: Duration::from_secs(5),
            death_time_mode: ShedMode::Disabled,
            death_time_safety_margin: Duration::from_millis(100),
        }
    }
}

/// Live, atomically replaceable configuration.
///
/// Uses `ArcSwap` so readers on the request path never block a reload.
#[derive(Debug)]
pub struct LiveConfig {
    load_shedding: ArcSwap<LoadSheddingPolicy>,
}

impl LiveConfig {
    #[must_use]
    pub fn new(policy: LoadSheddingPolicy) -> Self {
        Self {
            load_shedding: ArcSwap::from_pointee(policy),
        }
    }

    /// Replaces the load-shedding policy. Requests started afterwards see it.
    pub fn store(&self, policy: LoadSheddingPolicy) {
        tracing::info!(?policy, "load shedding policy updated");
        self.load_shedding.store(Arc::new(policy));
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(LoadSheddingPolicy::default())
    }
}

impl PolicySource for LiveConfig {
    fn load_shedding(&self) -> Arc<LoadSheddingPolicy> {
        self.load_shedding.load_full()
    }
}
