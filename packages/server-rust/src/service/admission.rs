//! Deadline-based admission control.
//!
//! Two independent checks run before a method is invoked:
//!
//! - **span age**: the immediate caller sent the request more than
//!   `max_span_age` ago
//! - **death time**: the outermost caller's `abandonRequestBy` deadline is
//!   within `death_time_safety_margin` or already passed
//!
//! Each check is `Disabled`, `LogOnly` (warn and serve) or `Drop` (reject with
//! `Overloaded`). Rejection is pre-emptive; work that already started is never
//! cancelled.

use rpchost_core::{TracingContext, UnixMillis};

use super::config::{LoadSheddingPolicy, ShedMode};
use super::error::{PipelineError, ShedReason};

/// Outcome of a successful admission check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Checks that fired in `LogOnly` mode.
    pub warnings: Vec<ShedReason>,
}

/// Evaluates the load-shedding policy against a request's tracing context.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionController;

impl AdmissionController {
    /// Runs both checks at wall-clock time `now`.
    ///
    /// `LogOnly` hits are logged and returned as warnings; the request is still
    /// admitted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Overloaded`] for the first `Drop` check that fires.
    pub fn evaluate(
        &self,
        ctx: &TracingContext,
        policy: &LoadSheddingPolicy,
        now: UnixMillis,
    ) -> Result<Admission, PipelineError> {
        let mut admission = Admission::default();

        if policy.span_age_mode != ShedMode::Disabled {
            if let Some(reason) = span_age_violation(ctx, policy, now) {
                apply(policy.span_age_mode, reason, ctx, &mut admission)?;
            }
        }

        if policy.death_time_mode != ShedMode::Disabled {
            if let Some(reason) = death_time_violation(ctx, policy, now) {
                apply(policy.death_time_mode, reason, ctx, &mut admission)?;
            }
        }

        Ok(admission)
    }
}

fn span_age_violation(
    ctx: &TracingContext,
    policy: &LoadSheddingPolicy,
    now: UnixMillis,
) -> Option<ShedReason> {
    let sent_at = ctx.span_start_time()?;
    if sent_at.saturating_add(policy.max_span_age) >= now {
        return None;
    }
    Some(ShedReason::SpanAge {
        caller_sent_at: sent_at,
        now,
        max_delay: policy.max_span_age,
        actual_delay: now.saturating_duration_since(sent_at),
    })
}

fn death_time_violation(
    ctx: &TracingContext,
    policy: &LoadSheddingPolicy,
    now: UnixMillis,
) -> Option<ShedReason> {
    let abandon_by = ctx.abandon_request_by()?;
    let cutoff = abandon_by.saturating_sub(policy.death_time_safety_margin);
    if now <= cutoff {
        return None;
    }
    Some(ShedReason::DeathTime {
        abandon_by,
        now,
        overage: now.saturating_duration_since(cutoff),
    })
}

fn apply(
    mode: ShedMode,
    reason: ShedReason,
    ctx: &TracingContext,
    admission: &mut Admission,
) -> Result<(), PipelineError> {
    metrics::counter!(
        "rpc_load_shed_total",
        "check" => reason.check(),
        "mode" => mode.as_str()
    )
    .increment(1);

    match mode {
        ShedMode::Disabled => Ok(()),
        ShedMode::LogOnly => {
            log_warning(&reason, ctx);
            admission.warnings.push(reason);
            Ok(())
        }
        ShedMode::Drop => Err(PipelineError::Overloaded(reason)),
    }
}

fn log_warning(reason: &ShedReason, ctx: &TracingContext) {
    let request_id = ctx.request_id().unwrap_or_default();
    match reason {
        ShedReason::SpanAge {
            caller_sent_at,
            now,
            max_delay,
            actual_delay,
        } => tracing::warn!(
            request_id,
            caller_sent_at = caller_sent_at.0,
            now = now.0,
            max_delay_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX),
            actual_delay_ms = u64::try_from(actual_delay.as_millis()).unwrap_or(u64::MAX),
            "request exceeded max span age; serving anyway (log-only)"
        ),
        ShedReason::DeathTime {
            abandon_by,
            now,
            overage,
        } => tracing::warn!(
            request_id,
            abandon_request_by = abandon_by.0,
            now = now.0,
            overage_ms = u64::try_from(overage.as_millis()).unwrap_or(u64::MAX),
            "request past its death time; serving anyway (log-only)"
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
