//! Metric instrument factories for notification-processor.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"notification-processor"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("notification-processor")
}

/// Counter: deliveries settled.
/// Labels: `disposition` ("acknowledged" | "rejected").
pub fn deliveries_settled() -> Counter<u64> {
    meter()
        .u64_counter("notification.deliveries.settled")
        .with_description("Number of deliveries acknowledged or rejected")
        .build()
}

/// Counter: commands handed to their handlers.
/// Labels: `kind`.
pub fn commands_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("notification.commands.dispatched")
        .with_description("Number of commands dispatched")
        .build()
}

/// Counter: deliveries that failed processing.
/// Labels: `class` ("decoding" | "validation" | "unregistered" | "handler" | "panic").
pub fn command_failures() -> Counter<u64> {
    meter()
        .u64_counter("notification.commands.failed")
        .with_description("Number of deliveries that failed processing")
        .build()
}

/// Histogram: pipeline duration per delivery in milliseconds.
/// Labels: `result` ("processed" | "failed").
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("notification.delivery.duration_ms")
        .with_description("Delivery processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive, set_vt).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("notification.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: incidents created.
pub fn incidents_created() -> Counter<u64> {
    meter()
        .u64_counter("notification.incidents.created")
        .with_description("Number of incidents created")
        .build()
}
