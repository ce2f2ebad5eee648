//! Span helpers for the dispatch and delivery paths.

use tracing::Span;

use crate::model::{Status, WorkId};

/// Start a span for a `start_work` call.
pub fn start_work_span(id: WorkId) -> Span {
    tracing::info_span!(
        "work.start",
        "work.id" = %id,
        "work.status" = tracing::field::Empty,
    )
}

/// Start a span for processing one delivery.
///
/// `work.id` is declared empty and filled once the handler has parsed the
/// correlation id; `work.status` once the completer applies a transition.
pub fn start_delivery_span(queue: &str, msg_id: i64, read_ct: i32) -> Span {
    tracing::info_span!(
        "delivery.process",
        "messaging.destination" = queue,
        "messaging.message.id" = msg_id,
        "messaging.delivery_count" = read_ct,
        "work.id" = tracing::field::Empty,
        "work.status" = tracing::field::Empty,
    )
}

/// Record which work item a span is about.
pub fn record_work_id(span: &Span, id: WorkId) {
    span.record("work.id", tracing::field::display(id));
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("work.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
