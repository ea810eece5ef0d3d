//! Publish spans
//!
//! One span per publish call, tagged with OpenTelemetry messaging attribute
//! names so an OTLP bridge can export it unchanged.

use tracing::field::Empty;
use tracing::Span;

/// Name of the span opened around every publish call
pub const PUBLISH_SPAN: &str = "courier.publish";

/// Open the span for one publish call.
///
/// `backend` is the producer kind (`amqp`, `socket`, `log`, `mqtt`).
pub fn publish_span(backend: &str, destination: &str) -> Span {
    tracing::info_span!(
        "courier.publish",
        otel.kind = "producer",
        messaging.system = %backend,
        messaging.destination.name = %destination,
        messaging.operation = "publish",
        messaging.message.body.size = Empty,
        otel.status_code = Empty,
        error.message = Empty,
    )
}

/// Record the outcome of the call on its span
pub fn record_success(span: &Span, payload_size: usize) {
    span.record("messaging.message.body.size", payload_size);
    span.record("otel.status_code", "OK");
}

/// Record a failure on the span
pub fn record_failure(span: &Span, error: &dyn std::fmt::Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", tracing::field::display(error));
}
