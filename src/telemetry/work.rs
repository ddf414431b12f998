//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for records
//! moving through claim, run, and release.

use tracing::Span;

/// Start a span for one claim/run/release pass over a record.
///
/// The `work.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_work_span(work_type: &str, reference_id: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.reference_id" = reference_id,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `debug` event scoped to the span and stores the new
/// state on its `work.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
