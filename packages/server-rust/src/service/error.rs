//! Error taxonomy for the request pipeline.
//!
//! Every failure on the request path is a [`PipelineError`]. The classifier
//! matches on [`ErrorKind`], never on concrete error types.

use std::time::Duration;

use http::{HeaderName, HeaderValue, StatusCode};
use rpchost_core::UnixMillis;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The classification-relevant kind of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Client-caused error that already carries its status.
    Request,
    Security,
    NotFound,
    Overloaded,
    Environment,
    Internal,
    /// Pure wrapper around another error; never the substantive cause.
    Wrapper,
}

// ---------------------------------------------------------------------------
// RequestError
// ---------------------------------------------------------------------------

/// Why a request was refused before it reached a method. Doubles as the
/// metric tag for the refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    ProtocolMismatch,
    MethodNotAllowed,
    UnsupportedContentType,
    EmptyBody,
    Malformed,
    InvalidArguments,
    Unprocessable,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::ProtocolMismatch => "protocol_mismatch",
            RejectReason::MethodNotAllowed => "method_not_allowed",
            RejectReason::UnsupportedContentType => "unsupported_content_type",
            RejectReason::EmptyBody => "empty_body",
            RejectReason::Malformed => "malformed",
            RejectReason::InvalidArguments => "invalid_arguments",
            RejectReason::Unprocessable => "unprocessable",
        }
    }
}

/// A client-caused error with its status already decided.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub status: StatusCode,
    pub reason: RejectReason,
    pub message: String,
    /// Header to attach to the error response (e.g. `Allow`, `Accept`).
    pub hint: Option<(HeaderName, HeaderValue)>,
}

impl RequestError {
    #[must_use]
    pub fn bad_request(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason,
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.hint = Some((name, value));
        self
    }
}

// ---------------------------------------------------------------------------
// ShedReason
// ---------------------------------------------------------------------------

/// Which admission check rejected (or would have rejected) a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShedReason {
    /// The immediate caller sent the request too long ago.
    SpanAge {
        caller_sent_at: UnixMillis,
        now: UnixMillis,
        max_delay: Duration,
        actual_delay: Duration,
    },
    /// The outermost caller's deadline is within the safety margin or passed.
    DeathTime {
        abandon_by: UnixMillis,
        now: UnixMillis,
        overage: Duration,
    },
}

impl ShedReason {
    /// Metric label of the check that fired.
    #[must_use]
    pub fn check(&self) -> &'static str {
        match self {
            ShedReason::SpanAge { .. } => "span_age",
            ShedReason::DeathTime { .. } => "death_time",
        }
    }
}

impl std::fmt::Display for ShedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShedReason::SpanAge {
                caller_sent_at,
                now,
                max_delay,
                actual_delay,
            } => write!(
                f,
                "request sent by caller at {} is {}ms old at {} (max {}ms)",
                caller_sent_at.0,
                actual_delay.as_millis(),
                now.0,
                max_delay.as_millis()
            ),
            ShedReason::DeathTime {
                abandon_by,
                now,
                overage,
            } => write!(
                f,
                "request deadline {} reached at {} ({}ms past the safety margin)",
                abandon_by.0,
                now.0,
                overage.as_millis()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors raised anywhere on the request path.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("forbidden: {message}")]
    Security { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("server overloaded: {0}")]
    Overloaded(ShedReason),
    #[error("service unavailable: {message}")]
    Environment { message: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
    #[error("{} errors, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Aggregate(Vec<PipelineError>),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Request(_) => ErrorKind::Request,
            PipelineError::Security { .. } => ErrorKind::Security,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Overloaded(_) => ErrorKind::Overloaded,
            PipelineError::Environment { .. } => ErrorKind::Environment,
            PipelineError::Internal(_) => ErrorKind::Internal,
            PipelineError::Wrapped { .. } | PipelineError::Aggregate(_) => ErrorKind::Wrapper,
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        PipelineError::Security {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound {
            message: message.into(),
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        PipelineError::Environment {
            message: message.into(),
        }
    }

    pub fn wrap(context: impl Into<String>, source: PipelineError) -> Self {
        PipelineError::Wrapped {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Follows wrapper causes down to the first substantive error.
    ///
    /// An aggregate resolves through its first member; an empty aggregate is
    /// itself the resolved cause. An internal error resolves through the
    /// first [`PipelineError`] in its `anyhow` chain, if any.
    #[must_use]
    pub fn root_cause(&self) -> &PipelineError {
        let mut current = self;
        loop {
            match current {
                PipelineError::Wrapped { source, .. } => current = source,
                PipelineError::Aggregate(inner) if !inner.is_empty() => current = &inner[0],
                PipelineError::Internal(error) => match classified_cause(error) {
                    Some(inner) => current = inner,
                    None => return current,
                },
                _ => return current,
            }
        }
    }

    /// Normalizes an error raised before method resolution completed: anything
    /// not already classified becomes a [`RequestError`].
    #[must_use]
    pub fn into_request_error(self, reason: RejectReason) -> Self {
        match self.root_cause().kind() {
            ErrorKind::Request
            | ErrorKind::Security
            | ErrorKind::NotFound
            | ErrorKind::Overloaded
            | ErrorKind::Environment => self,
            ErrorKind::Internal | ErrorKind::Wrapper => {
                PipelineError::Request(RequestError::bad_request(reason, self.to_string()))
            }
        }
    }
}

fn classified_cause(error: &anyhow::Error) -> Option<&PipelineError> {
    error
        .downcast_ref::<PipelineError>()
        .or_else(|| error.chain().find_map(|cause| cause.downcast_ref::<PipelineError>()))
}
