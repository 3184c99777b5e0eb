//! Observability events.
//!
//! The worker reports progress as a stream of `{type, data}` messages that
//! any UI can consume. Sending never blocks, and a dropped consumer is
//! ignored. Every event is mirrored to `tracing`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: String,
}

pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Cloneable sending side of the event stream.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    /// Sink that only logs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn info(&self, data: impl Into<String>) {
        let data = data.into();
        info!("{}", data);
        self.emit(EventKind::Info, data);
    }

    pub fn error(&self, data: impl Into<String>) {
        let data = data.into();
        error!("{}", data);
        self.emit(EventKind::Error, data);
    }

    fn emit(&self, kind: EventKind, data: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Event { kind, data });
        }
    }
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx: Some(tx) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let (sink, mut stream) = event_channel();
        sink.info("one");
        sink.error("two");
        assert_eq!(
            stream.try_recv().unwrap(),
            Event { kind: EventKind::Info, data: "one".into() }
        );
        assert_eq!(stream.try_recv().unwrap().kind, EventKind::Error);
    }

    #[test]
    fn test_dropped_consumer_does_not_block() {
        let (sink, stream) = event_channel();
        drop(stream);
        for i in 0..1000 {
            sink.info(format!("event {}", i));
        }
        EventSink::disabled().error("nobody listening");
    }

    #[test]
    fn test_wire_shape() {
        let event = Event { kind: EventKind::Error, data: "boom".into() };
        let json = serde_yaml::to_string(&event).unwrap();
        assert!(json.contains("type: error"));
    }
}
