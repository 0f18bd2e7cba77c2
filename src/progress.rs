//! Progress reporting
//!
//! One-way sink consumed by an external monitoring system. The engine never
//! blocks on or inspects the sink's outcome; a sink failure is at most a log
//! line, never an engine error.

use uuid::Uuid;

/// One progress or error event
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        session_id: u64,
        session_guid: Uuid,
        device_count: usize,
        percent: f64,
        message: String,
    },
    Error {
        session_id: u64,
        message: String,
    },
}

/// Fire-and-forget progress sink
pub trait ProgressSink: Send + Sync {
    fn report_progress(
        &self,
        session_id: u64,
        session_guid: Uuid,
        device_count: usize,
        percent: f64,
        message: &str,
    );

    fn report_error(&self, session_id: u64, message: &str);
}

/// Production sink: structured log lines the monitoring stack scrapes
#[derive(Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressSink for LogSink {
    fn report_progress(
        &self,
        session_id: u64,
        session_guid: Uuid,
        device_count: usize,
        percent: f64,
        message: &str,
    ) {
        tracing::info!(
            session_id,
            %session_guid,
            device_count,
            percent,
            message,
            "progress"
        );
    }

    fn report_error(&self, session_id: u64, message: &str) {
        tracing::error!(session_id, message, "session error");
    }
}

/// Test sink: collects events on an unbounded channel
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn report_progress(
        &self,
        session_id: u64,
        session_guid: Uuid,
        device_count: usize,
        percent: f64,
        message: &str,
    ) {
        // Receiver gone means nobody is watching; that's fine for a
        // fire-and-forget sink.
        let _ = self.tx.send(ProgressEvent::Progress {
            session_id,
            session_guid,
            device_count,
            percent,
            message: message.to_string(),
        });
    }

    fn report_error(&self, session_id: u64, message: &str) {
        let _ = self.tx.send(ProgressEvent::Error {
            session_id,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_collects_events() {
        let (sink, mut rx) = ChannelSink::new();
        let guid = Uuid::new_v4();

        sink.report_progress(1, guid, 100, 50.0, "halfway");
        sink.report_error(1, "boom");

        match rx.recv().await.unwrap() {
            ProgressEvent::Progress { percent, .. } => assert_eq!(percent, 50.0),
            other => panic!("expected progress, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProgressEvent::Error { message, .. } => assert_eq!(message, "boom"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.report_error(1, "nobody listening");
    }
}
