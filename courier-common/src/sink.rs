//! Fire-and-forget error reporting.
//!
//! The worker surfaces terminal drops, malformed records and panics as
//! tagged events to an external collaborator. Delivery of the events
//! themselves is best-effort; a sink must never block or fail the
//! caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

/// One reportable error with its tag metadata.
#[derive(Serialize, Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    pub tags: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
            tags: HashMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }
}

pub trait ErrorSink: Send + Sync {
    /// Deliver the event on a best-effort basis without blocking.
    fn capture(&self, event: ErrorEvent);
}

/// A sink that only emits a structured log line. The default when no
/// external collaborator is configured.
#[derive(Clone, Copy, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn capture(&self, event: ErrorEvent) {
        error!(tags = ?event.tags, "{}", event.message);
    }
}

/// A sink that POSTs each event as JSON to an operator-supplied URL on
/// a detached task. Send failures are logged and otherwise dropped.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpSink {
    pub fn new(endpoint: &str) -> Result<Self, url::ParseError> {
        let endpoint: reqwest::Url = endpoint.parse()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to construct reqwest client for error sink");

        Ok(Self { client, endpoint })
    }
}

impl ErrorSink for HttpSink {
    fn capture(&self, event: ErrorEvent) {
        let request = self.client.post(self.endpoint.clone()).json(&event);

        tokio::spawn(async move {
            if let Err(send_error) = request.send().await {
                warn!("failed to deliver error event: {}", send_error);
            }
        });
    }
}

/// A sink that collects events in memory, for test assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ErrorEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().expect("sink mutex poisoned").clone()
    }
}

impl ErrorSink for MemorySink {
    fn capture(&self, event: ErrorEvent) {
        self.events.lock().expect("sink mutex poisoned").push(event);
    }
}
