//! Background error reporting.

use std::sync::Mutex;

use tracing::error;

/// Receives errors that must not interrupt the caller (telemetry, background refreshes).
pub trait ErrorSink: Send + Sync {
    /// Record `error`; `context` names the operation that failed.
    fn report(&self, context: &str, error: &dyn std::error::Error);
}

/// Logs reported errors through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, context: &str, err: &dyn std::error::Error) {
        error!(context, error = %err, "background error");
    }
}

/// Keeps reported errors in memory.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorSink {
    /// Create an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(context, message)` pairs in report order.
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, context: &str, err: &dyn std::error::Error) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((context.to_string(), err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingErrorSink::new();
        let err = ValidationError::MissingField {
            field: "email".to_string(),
        };
        sink.report("invite", &err);
        TracingErrorSink.report("invite", &err);
        assert_eq!(
            sink.reports(),
            vec![("invite".to_string(), "Required field 'email' is missing".to_string())]
        );
    }
}
