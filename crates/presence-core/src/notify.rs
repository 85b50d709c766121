use crate::types::AttendanceEvent;
use std::sync::mpsc;
use std::sync::Mutex;

/// Receives attendance confirmations for user-facing display.
///
/// Fire-and-forget: delivery failures are the sink's problem, never the
/// pipeline's.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: AttendanceEvent);
}

impl NotificationSink for Mutex<mpsc::Sender<AttendanceEvent>> {
    fn notify(&self, event: AttendanceEvent) {
        let tx = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tx.send(event).is_err() {
            tracing::debug!("attendance event dropped: receiver gone");
        }
    }
}

impl NotificationSink for mpsc::SyncSender<AttendanceEvent> {
    fn notify(&self, event: AttendanceEvent) {
        if let Err(err) = self.try_send(event) {
            tracing::warn!(error = %err, "attendance event dropped");
        }
    }
}

/// Sink that only logs.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: AttendanceEvent) {
        tracing::info!(id = event.id, name = %event.name, "attendance recorded");
    }
}
