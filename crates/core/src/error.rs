use thiserror::Error;

/// Errors surfaced by the audit capture pipeline and writer.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The logger or a table was misconfigured (e.g. missing primary key).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A captured row could not be turned into an audit record.
    #[error("capture error: {0}")]
    Capture(String),

    /// The writer queue is at capacity.
    #[error("audit queue full: {queued} queued, capacity {capacity}")]
    QueueFull { queued: usize, capacity: usize },

    /// A flush failed while persisting a batch of audit records.
    #[error("audit write failed: {0}")]
    Write(String),

    /// The writer has been shut down and rejects further records.
    #[error("audit writer is shut down")]
    Closed,

    /// An intercepted statement failed to build or execute.
    #[error("query error: {0}")]
    Query(String),

    /// A value could not be serialized for capture.
    #[error("serialization error: {0}")]
    Serialization(String),
}
