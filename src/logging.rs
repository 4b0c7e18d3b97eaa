use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const RING_CAPACITY: usize = 500;

/// One entry in the in-memory log feed the runtime manager exposes for
/// introspection (the administrative GUI polls this; the GUI itself is
/// out of scope here).
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub channel: Option<String>,
    pub message: String,
}

#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        if let Ok(mut buf) = self.inner.lock() {
            if buf.len() >= RING_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(entry);
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.inner.lock().map(|b| b.iter().cloned().collect()).unwrap_or_default()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

/// A tracing `Layer` that mirrors every event into a `LogRing` for the
/// introspection surface to poll.
pub struct RingBufferLayer {
    pub ring: LogRing,
}

impl<S> Layer<S> for RingBufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > tracing::Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.ring.push(LogEntry {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            channel: visitor.channel,
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    channel: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "channel" => self.channel = Some(format!("{value:?}").trim_matches('"').to_string()),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "channel" => self.channel = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Initializes the global tracing subscriber: an `EnvFilter` defaulting
/// to a sane level, a fmt layer for stdout, and a ring-buffer layer for
/// introspection.
pub fn init(ring: LogRing) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "localbridge=info".into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(RingBufferLayer { ring })
        .try_init();
}
