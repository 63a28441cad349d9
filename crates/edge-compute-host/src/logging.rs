//! Log endpoints.
//!
//! Guest log lines are both:
//! 1. Stored per session for later retrieval
//! 2. Emitted via the `tracing` crate for observability

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

use edge_compute_common::HostError;

/// A single line written to a log endpoint.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub endpoint: String,
    pub message: String,
    pub timestamp: Instant,
}

/// The log endpoints of one session.
#[derive(Debug)]
pub struct LogEndpoints {
    request_id: String,
    /// `None` accepts any endpoint name.
    allowed: Option<HashSet<String>>,
    entries: Mutex<Vec<LogEntry>>,
}

impl LogEndpoints {
    /// Endpoints accepting any name.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            allowed: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints accepting only `names`.
    #[must_use]
    pub fn restricted_to<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn check(&self, endpoint: &str) -> Result<(), HostError> {
        match &self.allowed {
            Some(allowed) if !allowed.contains(endpoint) => {
                Err(HostError::invalid_argument("log_endpoint_get"))
            }
            _ => Ok(()),
        }
    }

    pub fn write(&self, endpoint: &str, message: &str) -> Result<(), HostError> {
        self.check(endpoint)?;

        self.entries.lock().push(LogEntry {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
            timestamp: Instant::now(),
        });

        let request_id = &self.request_id;
        info!(request_id, endpoint, guest_log = true, "{}", message);
        Ok(())
    }

    /// Lines written so far, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Lines written to `endpoint`.
    pub fn messages(&self, endpoint: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.endpoint == endpoint)
            .map(|e| e.message.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_stores_entries() {
        let logs = LogEndpoints::new("test-123");

        logs.write("stdout", "Hello").unwrap();
        logs.write("audit", "World").unwrap();

        let entries = logs.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].endpoint, "stdout");
        assert_eq!(entries[0].message, "Hello");
        assert_eq!(entries[1].endpoint, "audit");
        assert_eq!(logs.messages("audit"), vec!["World"]);
    }

    #[test]
    fn test_restricted_endpoints() {
        let logs = LogEndpoints::new("test").restricted_to(["audit"]);

        assert!(logs.check("audit").is_ok());
        assert!(logs.check("stdout").unwrap_err().is_invalid_argument());
        assert!(logs.write("stdout", "dropped").is_err());
        assert!(logs.entries().is_empty());
    }
}
