//! Testing utilities for span assertions
//!
//! [`SpanRecorder`] is a `tracing_subscriber` layer that remembers every span
//! it saw open and close, with the fields each span was created with.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// A span as seen by the recorder
#[derive(Debug, Clone, Default)]
pub struct RecordedSpan {
    pub name: String,
    pub fields: HashMap<String, String>,
    pub closed: bool,
}

#[derive(Default)]
struct Recorded {
    spans: Vec<RecordedSpan>,
    by_id: HashMap<u64, usize>,
}

/// Span capture utility for testing
///
/// ## Example
///
/// ```
/// use courier_observability::testing::SpanRecorder;
///
/// let recorder = SpanRecorder::new();
/// tracing::subscriber::with_default(recorder.subscriber(), || {
///     let _span = courier_observability::publish_span("amqp", "orders").entered();
/// });
///
/// assert_eq!(recorder.opened("courier.publish"), 1);
/// assert_eq!(recorder.closed("courier.publish"), 1);
/// ```
#[derive(Clone, Default)]
pub struct SpanRecorder {
    recorded: Arc<Mutex<Recorded>>,
}

impl SpanRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry subscriber with only this layer attached
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        tracing_subscriber::registry().with(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of spans with this name that were opened
    pub fn opened(&self, name: &str) -> usize {
        self.lock().spans.iter().filter(|s| s.name == name).count()
    }

    /// Number of spans with this name that were closed
    pub fn closed(&self, name: &str) -> usize {
        self.lock()
            .spans
            .iter()
            .filter(|s| s.name == name && s.closed)
            .count()
    }

    /// Every recorded span with this name, in creation order
    pub fn spans(&self, name: &str) -> Vec<RecordedSpan> {
        self.lock()
            .spans
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut recorded = self.lock();
        recorded.spans.clear();
        recorded.by_id.clear();
    }
}

impl fmt::Debug for SpanRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanRecorder")
            .field("spans", &self.lock().spans.len())
            .finish()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

impl<S> Layer<S> for SpanRecorder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut span = RecordedSpan {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        };
        attrs.record(&mut FieldVisitor(&mut span.fields));

        let mut recorded = self.lock();
        let index = recorded.spans.len();
        recorded.spans.push(span);
        recorded.by_id.insert(id.into_u64(), index);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut recorded = self.lock();
        if let Some(&index) = recorded.by_id.get(&id.into_u64()) {
            values.record(&mut FieldVisitor(&mut recorded.spans[index].fields));
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let mut recorded = self.lock();
        // Span ids are reused after close
        if let Some(index) = recorded.by_id.remove(&id.into_u64()) {
            recorded.spans[index].closed = true;
        }
    }
}
