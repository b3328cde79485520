use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AuditError;
use crate::record::AuditLogEntry;

/// Persistence backend for resolved audit rows.
///
/// Implementations must be `Send + Sync` to be shared across async tasks.
/// A call persists the whole batch atomically or fails it as a unit; the
/// writer applies the strict/lenient policy around failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist a batch of audit rows.
    async fn write(&self, entries: &[AuditLogEntry]) -> Result<(), AuditError>;
}

/// In-memory sink suitable for development and testing.
///
/// Entries are kept in write order, matching the persistence ordering
/// guarantees of the real backends.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every persisted entry, in write order.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().expect("memory sink mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory sink mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, entries: &[AuditLogEntry]) -> Result<(), AuditError> {
        self.entries
            .lock()
            .expect("memory sink mutex poisoned")
            .extend_from_slice(entries);
        Ok(())
    }
}
