//! Failure classification: maps a [`PipelineError`] to a status and payload.

use http::StatusCode;
use serde::Serialize;
use serde_json::json;

use super::error::{ErrorKind, PipelineError, ShedReason};
use crate::network::RpcResponse;

/// Serialized body of a classified error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Result of classifying a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub status: StatusCode,
    pub payload: ErrorPayload,
}

/// Maps `error` to a status code and payload. Never fails.
///
/// Wrapper causes are unwrapped first; the payload always describes the
/// resolved cause, never the wrapper.
#[must_use]
pub fn classify(error: &PipelineError) -> Classified {
    let cause = error.root_cause();
    let kind = cause.kind();
    let status = match cause {
        PipelineError::Request(req) => req.status,
        PipelineError::Security { .. } => StatusCode::FORBIDDEN,
        PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Overloaded(_) | PipelineError::Environment { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PipelineError::Internal(_) | PipelineError::Wrapped { .. } | PipelineError::Aggregate(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let kind = if kind == ErrorKind::Wrapper {
        ErrorKind::Internal
    } else {
        kind
    };

    Classified {
        status,
        payload: ErrorPayload {
            kind,
            message: cause.to_string(),
            details: details(cause),
        },
    }
}

fn details(cause: &PipelineError) -> Option<serde_json::Value> {
    match cause {
        PipelineError::Request(req) => Some(json!({ "reason": req.reason.as_str() })),
        PipelineError::Overloaded(ShedReason::SpanAge {
            caller_sent_at,
            now,
            max_delay,
            actual_delay,
        }) => Some(json!({
            "check": "span_age",
            "callerSentAt": caller_sent_at.0,
            "now": now.0,
            "maxDelayMs": duration_ms(*max_delay),
            "actualDelayMs": duration_ms(*actual_delay),
        })),
        PipelineError::Overloaded(ShedReason::DeathTime {
            abandon_by,
            now,
            overage,
        }) => Some(json!({
            "check": "death_time",
            "abandonRequestBy": abandon_by.0,
            "now": now.0,
            "overageMs": duration_ms(*overage),
        })),
        _ => None,
    }
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Builds the wire response for a failure, including any hint header the
/// resolved cause carries.
#[must_use]
pub fn error_response(error: &PipelineError) -> RpcResponse {
    let classified = classify(error);
    let body = serde_json::to_vec(&classified.payload).unwrap_or_else(|_| {
        br#"{"kind":"Internal","message":"error payload could not be encoded"}"#.to_vec()
    });
    let mut response = RpcResponse::json(classified.status, body);
    if let PipelineError::Request(req) = error.root_cause() {
        if let Some((name, value)) = &req.hint {
            response.headers.insert(name.clone(), value.clone());
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
