// crates/cadence-core/src/audit/mod.rs
// Append-only audit log for routing decisions, breaker transitions, blocks and timeouts

pub mod sqlite;

use crate::error::Result;
use async_trait::async_trait;
use cadence_types::{AuditEvent, AuditRecord};
use parking_lot::Mutex;
use std::sync::Arc;

pub use sqlite::SqliteEventLog;

/// Build a record stamped with the current time
pub fn record(session_id: Option<&str>, turn_number: Option<u64>, event: AuditEvent) -> AuditRecord {
    AuditRecord {
        session_id: session_id.map(str::to_string),
        turn_number,
        timestamp: chrono::Utc::now().to_rfc3339(),
        event,
    }
}

/// Destination for audit records.
///
/// `append` must not block; records are persisted in call order.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn append(&self, record: AuditRecord);

    /// Wait until every appended record is durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedSink = Arc<dyn EventSink>;

/// In-process log, used by tests and the `simulate` command
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records whose event kind matches (e.g. "routing")
    pub fn of_kind(&self, kind: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventSink for MemoryEventLog {
    fn append(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLog;

impl EventSink for NullEventLog {
    fn append(&self, _record: AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_event(id: &str) -> AuditEvent {
        AuditEvent::TaskTimeout {
            task_id: id.to_string(),
            age_secs: 301,
        }
    }

    #[test]
    fn test_memory_log_preserves_order() {
        let log = MemoryEventLog::new();
        assert!(log.is_empty());
        for id in ["a", "b", "c"] {
            log.append(record(Some("s-1"), Some(1), timeout_event(id)));
        }
        let ids: Vec<String> = log
            .records()
            .into_iter()
            .filter_map(|r| match r.event {
                AuditEvent::TaskTimeout { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(log.of_kind("task_timeout").len(), 3);
        assert!(log.of_kind("routing").is_empty());
    }

    #[test]
    fn test_record_timestamp_is_rfc3339() {
        let r = record(None, None, timeout_event("x"));
        assert!(chrono::DateTime::parse_from_rfc3339(&r.timestamp).is_ok());
        assert!(r.session_id.is_none());
    }

    #[tokio::test]
    async fn test_null_log_flushes() {
        let log = NullEventLog;
        log.append(record(None, None, timeout_event("x")));
        log.flush().await.unwrap();
    }
}
