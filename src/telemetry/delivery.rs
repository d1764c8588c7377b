//! Delivery processing span helpers.

use tracing::Span;

use crate::command::CommandKind;

/// Start a span covering one delivery from pipeline to settlement.
///
/// `command.kind` and `delivery.disposition` are declared empty and
/// filled in as processing progresses.
pub fn start_delivery_span(delivery_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "delivery.process",
        "delivery.id" = delivery_id,
        "delivery.attempt" = attempt,
        "command.kind" = tracing::field::Empty,
        "delivery.disposition" = tracing::field::Empty,
    )
}

pub fn record_command_kind(span: &Span, kind: CommandKind) {
    span.record("command.kind", kind.tag());
}

pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("delivery.disposition", disposition);
}
