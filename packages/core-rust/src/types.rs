//! Wire types decoded from (and encoded into) RPC request bodies.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON field
//! names match the wire contract (`serviceName`, `tracingData`, ...).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// UnixMillis
// ---------------------------------------------------------------------------

/// Wall-clock instant as milliseconds since the Unix epoch.
///
/// Used for `spanStartTime` and `abandonRequestBy`, which cross process
/// boundaries and therefore cannot be `std::time::Instant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    /// Current wall-clock time. A clock set before 1970 reads as the epoch.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(duration_to_millis(elapsed))
    }

    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        Self(self.0.saturating_add(duration_to_millis(delta)))
    }

    #[must_use]
    pub fn saturating_sub(self, delta: Duration) -> Self {
        Self(self.0.saturating_sub(duration_to_millis(delta)))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: UnixMillis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// Identifies the method a request wants to call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeTarget {
    pub service_name: String,
    pub method_name: String,
    /// Arguments are matched to parameters by name and coerced.
    #[serde(default)]
    pub is_weakly_typed: bool,
}

impl std::fmt::Display for InvokeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service_name, self.method_name)
    }
}

/// Per-request identity and timing record supplied by the caller.
///
/// Every field is optional on the wire; the pipeline generates `request_id`
/// when it is absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<String>,
    /// When the immediate caller issued this call.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub span_start_time: Option<UnixMillis>,
    /// When the outermost caller gives up waiting.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub abandon_request_by: Option<UnixMillis>,
}

/// Redirects calls meant for `service_name` to `host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostOverride {
    pub service_name: String,
    pub host: String,
}

/// Wire form of the caller's overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridesData {
    #[serde(default)]
    pub hosts: Vec<HostOverride>,
}

/// A decoded RPC request. Owned by the pipeline instance that handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    pub target: InvokeTarget,
    /// Parameter name to encoded value, in the order the caller sent them.
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overrides: Option<OverridesData>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tracing_data: Option<TracingData>,
    /// Taken from the transport envelope header, never from the body.
    #[serde(skip)]
    pub protocol_version: Option<String>,
}

impl IncomingRequest {
    /// Creates a request for `target` with no arguments or tracing data.
    #[must_use]
    pub fn new(target: InvokeTarget) -> Self {
        Self {
            target,
            arguments: Map::new(),
            overrides: None,
            tracing_data: None,
            protocol_version: None,
        }
    }
}
