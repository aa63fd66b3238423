use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidRecordHeader { offset: u64, reason: &'static str },

    #[error("corrupt record body: string field {field} overruns the record")]
    CorruptRecord { field: usize },

    #[error("corrupt index table {path}: {reason}")]
    CorruptIndex { path: String, reason: &'static str },

    #[error("audit pipe is not wired")]
    PipeNotWired,

    #[error("permission denied: {0} requires the audit-admin privilege")]
    PermissionDenied(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("collector already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, AuditError>;
