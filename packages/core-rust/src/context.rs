use std::collections::BTreeMap;

use crate::types::{HostOverride, TracingData, UnixMillis};

// ---------------------------------------------------------------------------
// Keys and values
// ---------------------------------------------------------------------------

/// The fixed set of keys a [`TracingContext`] can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    RequestId,
    SpanId,
    ParentSpanId,
    SpanStartTime,
    AbandonRequestBy,
    Overrides,
}

/// A typed value stored under a [`ContextKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Text(String),
    Time(UnixMillis),
    Overrides(RequestOverrides),
}

impl ContextKey {
    fn accepts(self, value: &ContextValue) -> bool {
        matches!(
            (self, value),
            (
                ContextKey::RequestId | ContextKey::SpanId | ContextKey::ParentSpanId,
                ContextValue::Text(_)
            ) | (
                ContextKey::SpanStartTime | ContextKey::AbandonRequestBy,
                ContextValue::Time(_)
            ) | (ContextKey::Overrides, ContextValue::Overrides(_))
        )
    }
}

/// Usage errors raised by [`TracingContext`] setters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("tracing context used before set_up()")]
    NotInitialized,
    #[error("value has the wrong type for key {key:?}")]
    TypeMismatch { key: ContextKey },
    #[error("request id is already assigned ({current})")]
    RequestIdAssigned { current: String },
}

// ---------------------------------------------------------------------------
// RequestOverrides
// ---------------------------------------------------------------------------

/// Ordered set of host overrides, unique by service name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestOverrides {
    hosts: Vec<HostOverride>,
}

impl RequestOverrides {
    /// Adds an override, replacing any existing one for the same service in place.
    pub fn set_host(&mut self, service_name: impl Into<String>, host: impl Into<String>) {
        let service_name = service_name.into();
        let host = host.into();
        match self.hosts.iter_mut().find(|o| o.service_name == service_name) {
            Some(existing) => existing.host = host,
            None => self.hosts.push(HostOverride { service_name, host }),
        }
    }

    #[must_use]
    pub fn host(&self, service_name: &str) -> Option<&str> {
        self.hosts
            .iter()
            .find(|o| o.service_name == service_name)
            .map(|o| o.host.as_str())
    }

    #[must_use]
    pub fn hosts(&self) -> &[HostOverride] {
        &self.hosts
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TracingContext
// ---------------------------------------------------------------------------

/// Per-call-chain identity and timing store.
///
/// The context is a plain owned value. It reaches nested work because callers
/// pass it along, and a child task receives [`TracingContext::fork`] of its
/// parent's context at spawn time. Forks share nothing: later writes on either
/// side are invisible to the other.
///
/// A context starts detached (no storage cell). [`TracingContext::set_up`]
/// creates the cell; writing to a detached context fails with
/// [`ContextError::NotInitialized`]. Reads on a detached context return `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracingContext {
    cell: Option<BTreeMap<ContextKey, ContextValue>>,
}

impl TracingContext {
    /// A context with no storage cell yet.
    #[must_use]
    pub fn detached() -> Self {
        Self { cell: None }
    }

    /// Ensures the storage cell exists. Calling it again keeps existing values.
    pub fn set_up(&mut self) {
        self.cell.get_or_insert_with(BTreeMap::new);
    }

    #[must_use]
    pub fn is_set_up(&self) -> bool {
        self.cell.is_some()
    }

    /// Copy of this context for a child unit of work.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// - [`ContextError::NotInitialized`] before `set_up()`
    /// - [`ContextError::TypeMismatch`] when the value kind does not fit the key
    /// - [`ContextError::RequestIdAssigned`] when replacing an assigned request id
    ///   with a different one
    pub fn set(&mut self, key: ContextKey, value: ContextValue) -> Result<(), ContextError> {
        let cell = self.cell.as_mut().ok_or(ContextError::NotInitialized)?;
        if !key.accepts(&value) {
            return Err(ContextError::TypeMismatch { key });
        }
        if key == ContextKey::RequestId {
            if let Some(ContextValue::Text(current)) = cell.get(&key) {
                if ContextValue::Text(current.clone()) != value {
                    return Err(ContextError::RequestIdAssigned {
                        current: current.clone(),
                    });
                }
            }
        }
        cell.insert(key, value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.cell.as_ref().and_then(|cell| cell.get(&key))
    }

    fn text(&self, key: ContextKey) -> Option<&str> {
        match self.get(key) {
            Some(ContextValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn time(&self, key: ContextKey) -> Option<UnixMillis> {
        match self.get(key) {
            Some(ContextValue::Time(t)) => Some(*t),
            _ => None,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.text(ContextKey::RequestId)
    }

    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.text(ContextKey::SpanId)
    }

    #[must_use]
    pub fn parent_span_id(&self) -> Option<&str> {
        self.text(ContextKey::ParentSpanId)
    }

    #[must_use]
    pub fn span_start_time(&self) -> Option<UnixMillis> {
        self.time(ContextKey::SpanStartTime)
    }

    #[must_use]
    pub fn abandon_request_by(&self) -> Option<UnixMillis> {
        self.time(ContextKey::AbandonRequestBy)
    }

    /// # Errors
    ///
    /// See [`TracingContext::set`].
    pub fn set_request_id(&mut self, request_id: impl Into<String>) -> Result<(), ContextError> {
        self.set(ContextKey::RequestId, ContextValue::Text(request_id.into()))
    }

    /// Publishes every present field of `data` into the context.
    ///
    /// # Errors
    ///
    /// See [`TracingContext::set`].
    pub fn apply_tracing_data(&mut self, data: &TracingData) -> Result<(), ContextError> {
        let texts = [
            (ContextKey::RequestId, &data.request_id),
            (ContextKey::SpanId, &data.span_id),
            (ContextKey::ParentSpanId, &data.parent_span_id),
        ];
        for (key, value) in texts {
            if let Some(v) = value {
                self.set(key, ContextValue::Text(v.clone()))?;
            }
        }
        if let Some(t) = data.span_start_time {
            self.set(ContextKey::SpanStartTime, ContextValue::Time(t))?;
        }
        if let Some(t) = data.abandon_request_by {
            self.set(ContextKey::AbandonRequestBy, ContextValue::Time(t))?;
        }
        Ok(())
    }

    /// Snapshot of the tracing fields currently held.
    #[must_use]
    pub fn tracing_data(&self) -> TracingData {
        TracingData {
            request_id: self.request_id().map(str::to_string),
            span_id: self.span_id().map(str::to_string),
            parent_span_id: self.parent_span_id().map(str::to_string),
            span_start_time: self.span_start_time(),
            abandon_request_by: self.abandon_request_by(),
        }
    }

    #[must_use]
    pub fn overrides(&self) -> Option<&RequestOverrides> {
        match self.get(ContextKey::Overrides) {
            Some(ContextValue::Overrides(o)) => Some(o),
            _ => None,
        }
    }

    /// Creates or replaces the override for `service_name` in this chain.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotInitialized`] before `set_up()`.
    pub fn set_host_override(
        &mut self,
        service_name: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<(), ContextError> {
        let cell = self.cell.as_mut().ok_or(ContextError::NotInitialized)?;
        let entry = cell
            .entry(ContextKey::Overrides)
            .or_insert_with(|| ContextValue::Overrides(RequestOverrides::default()));
        if let ContextValue::Overrides(overrides) = entry {
            overrides.set_host(service_name, host);
        }
        Ok(())
    }

    #[must_use]
    pub fn host_override(&self, service_name: &str) -> Option<&str> {
        self.overrides().and_then(|o| o.host(service_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> TracingContext {
        let mut ctx = TracingContext::detached();
        ctx.set_up();
        ctx
    }

    #[test]
    fn setters_fail_before_set_up() {
        let mut ctx = TracingContext::detached();
        assert_eq!(ctx.set_request_id("r"), Err(ContextError::NotInitialized));
        assert_eq!(
            ctx.set_host_override("Billing", "h"),
            Err(ContextError::NotInitialized)
        );
        assert!(ctx.request_id().is_none());
    }

    #[test]
    fn set_up_is_idempotent() {
        let mut ctx = ready();
        ctx.set_request_id("r-1").unwrap();
        ctx.set_up();
        assert_eq!(ctx.request_id(), Some("r-1"));
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let mut ctx = ready();
        let err = ctx
            .set(ContextKey::SpanStartTime, ContextValue::Text("soon".into()))
            .unwrap_err();
        assert_eq!(err, ContextError::TypeMismatch { key: ContextKey::SpanStartTime });
    }

    #[test]
    fn request_id_never_changes_once_assigned() {
        let mut ctx = ready();
        ctx.set_request_id("r-1").unwrap();
        ctx.set_request_id("r-1").unwrap();
        assert!(matches!(
            ctx.set_request_id("r-2"),
            Err(ContextError::RequestIdAssigned { .. })
        ));
        assert_eq!(ctx.request_id(), Some("r-1"));
    }

    #[test]
    fn fork_is_isolated_in_both_directions() {
        let mut parent = ready();
        parent.set(ContextKey::SpanId, ContextValue::Text("a".into())).unwrap();

        let mut child = parent.fork();
        assert_eq!(child.span_id(), Some("a"));

        child.set(ContextKey::SpanId, ContextValue::Text("b".into())).unwrap();
        parent.set_host_override("Billing", "canary").unwrap();

        assert_eq!(parent.span_id(), Some("a"));
        assert_eq!(child.span_id(), Some("b"));
        assert!(child.host_override("Billing").is_none());
    }

    #[test]
    fn fork_moves_into_another_thread() {
        let mut parent = ready();
        parent.set_request_id("outer").unwrap();
        let mut child = parent.fork();
        let child = std::thread::spawn(move || {
            child.set(ContextKey::SpanId, ContextValue::Text("inner".into())).unwrap();
            child
        })
        .join()
        .unwrap();

        assert_eq!(child.request_id(), Some("outer"));
        assert_eq!(child.span_id(), Some("inner"));
        assert!(parent.span_id().is_none());
    }

    #[test]
    fn apply_tracing_data_publishes_present_fields() {
        let mut ctx = ready();
        let data = TracingData {
            request_id: Some("r".into()),
            span_id: None,
            parent_span_id: Some("p".into()),
            span_start_time: Some(UnixMillis(10)),
            abandon_request_by: None,
        };
        ctx.apply_tracing_data(&data).unwrap();
        assert_eq!(ctx.tracing_data(), data);
    }

    #[test]
    fn host_override_replaces_existing_entry() {
        let mut ctx = ready();
        ctx.set_host_override("Billing", "a").unwrap();
        ctx.set_host_override("Ledger", "b").unwrap();
        ctx.set_host_override("Billing", "c").unwrap();

        assert_eq!(ctx.host_override("Billing"), Some("c"));
        assert_eq!(ctx.host_override("Nope"), None);
        let names: Vec<_> = ctx
            .overrides()
            .unwrap()
            .hosts()
            .iter()
            .map(|o| o.service_name.as_str())
            .collect();
        assert_eq!(names, vec!["Billing", "Ledger"]);
    }
}
