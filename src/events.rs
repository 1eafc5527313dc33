//! Append-only session event stream.

use std::fmt;
use std::sync::Mutex;

use time::OffsetDateTime;
use tracing::info;

/// Tag of events recorded whenever a hook replaces a request or response.
pub const SPOOFED_RESPONSE: &str = "http.proxy.spoofed-response";

/// Audit record of one synthesized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionEvent {
    /// Client IP address, port stripped.
    pub to: String,
    pub method: String,
    pub host: String,
    pub path: String,
    /// Length of the synthesized body in bytes.
    pub size: usize,
}

impl fmt::Display for InterceptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{} ({} bytes)",
            self.to, self.method, self.host, self.path, self.size
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    Interception(InterceptionEvent),
}

impl fmt::Display for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventData::Interception(event) => event.fmt(f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub tag: String,
    pub time: OffsetDateTime,
    pub data: EventData,
}

/// Sink accepting tagged events from any number of connections.
///
/// A single `add` must be atomic; no ordering across callers is implied.
pub trait EventSink: Send + Sync {
    fn add(&self, tag: &str, data: EventData);
}

/// In-memory event log.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded event.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot of the events carrying `tag`.
    pub fn by_tag(&self, tag: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.tag == tag)
            .cloned()
            .collect()
    }

    /// Interception records, in append order.
    pub fn interceptions(&self) -> Vec<InterceptionEvent> {
        self.by_tag(SPOOFED_RESPONSE)
            .into_iter()
            .map(|e| match e.data {
                EventData::Interception(event) => event,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for EventLog {
    fn add(&self, tag: &str, data: EventData) {
        info!("[{}] {}", tag, data);
        let event = Event {
            tag: tag.to_string(),
            time: OffsetDateTime::now_utc(),
            data,
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
