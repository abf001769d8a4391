//! Forwarding the worker-wide log stream to clients (§4.2 "Log forwarding", §6).
//!
//! The logging subsystem itself is out of scope (§1); this module only
//! describes the record shape forwarded to clients and the `tracing` layer
//! that taps the process's own log stream to produce it, matching how
//! `pg_doorman` wires `tracing-subscriber` (`src/app/logger.rs`) — the local
//! process log and the per-client `logEvent` notifications are two readers
//! of one source.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// One forwarded log record (§4.2).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub logger_name: String,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
}

impl LogRecord {
    /// `[<loggerName>] <levelName>: <timestamp>: <message>` followed
    /// optionally by the error and stack trace on subsequent lines (§4.2).
    pub fn format_line(&self) -> String {
        let mut line = format!(
            "[{}] {}: {}: {}",
            self.logger_name,
            self.level,
            self.timestamp.to_rfc3339(),
            self.message
        );
        if let Some(error) = &self.error {
            line.push('\n');
            line.push_str(error);
        }
        if let Some(stack_trace) = &self.stack_trace {
            line.push('\n');
            line.push_str(stack_trace);
        }
        line
    }
}

/// The worker-wide log stream every [`crate::client::ConnectedClient`]
/// subscribes to. No backpressure is specified (§9); a slow client drops
/// records rather than stalling the log stream — `broadcast` gives us this
/// for free via `RecvError::Lagged`.
#[derive(Clone)]
pub struct LogHub {
    sender: broadcast::Sender<LogRecord>,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        LogHub { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }

    fn publish(&self, record: LogRecord) {
        let _ = self.sender.send(record);
    }
}

/// A `tracing_subscriber::Layer` that republishes every event it sees onto a
/// [`LogHub`], alongside whatever other layers (stdout formatting, JSON,
/// …) are installed on the subscriber.
pub struct LogHubLayer {
    hub: LogHub,
}

impl LogHubLayer {
    pub fn new(hub: LogHub) -> Self {
        LogHubLayer { hub }
    }
}

impl<S: Subscriber> Layer<S> for LogHubLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.hub.publish(LogRecord {
            logger_name: metadata.target().to_string(),
            level: *metadata.level(),
            timestamp: Utc::now(),
            message: visitor.message.unwrap_or_default(),
            error: visitor.error,
            stack_trace: None,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    error: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "error" | "err" => self.error = Some(format!("{value:?}")),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "error" | "err" => self.error = Some(value.to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_line_without_error_or_stack() {
        let record = LogRecord {
            logger_name: "coordinator::runner".to_string(),
            level: Level::WARN,
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            message: "engine abort failed".to_string(),
            error: None,
            stack_trace: None,
        };
        assert_eq!(
            record.format_line(),
            "[coordinator::runner] WARN: 2026-01-01T00:00:00+00:00: engine abort failed"
        );
    }

    #[test]
    fn format_line_with_error_and_stack() {
        let record = LogRecord {
            logger_name: "coordinator::runner".to_string(),
            level: Level::ERROR,
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            message: "handshake failed".to_string(),
            error: Some("Disconnected".to_string()),
            stack_trace: Some("at requestDatabase".to_string()),
        };
        let lines: Vec<&str> = record.format_line().lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "Disconnected");
        assert_eq!(lines[2], "at requestDatabase");
    }
}
