use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaskError>;

/// Errors raised by the hash, ordered and table stores.
///
/// `NotFound` is the only recoverable kind: it reports an absent record or
/// an unset cursor. Every other variant means the operation had no effect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaskError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Corrupted data: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Database is not open")]
    NotOpen,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl CaskError {
    /// Get the inner message without the type prefix.
    pub fn message(&self) -> String {
        match self {
            CaskError::Io(msg)
            | CaskError::Lock(msg)
            | CaskError::Corrupt(msg)
            | CaskError::NotFound(msg)
            | CaskError::AlreadyExists(msg)
            | CaskError::InvalidOperation(msg)
            | CaskError::Config(msg)
            | CaskError::Transaction(msg)
            | CaskError::Query(msg) => msg.clone(),
            CaskError::NotOpen => "database is not open".to_string(),
            CaskError::TypeError { expected, actual } => {
                format!("expected {expected}, got {actual}")
            }
        }
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            CaskError::Io(_) => "io_error",
            CaskError::Lock(_) => "lock_error",
            CaskError::Corrupt(_) => "corrupt",
            CaskError::NotFound(_) => "not_found",
            CaskError::AlreadyExists(_) => "already_exists",
            CaskError::NotOpen => "not_open",
            CaskError::InvalidOperation(_) => "invalid_operation",
            CaskError::TypeError { .. } => "type_error",
            CaskError::Config(_) => "config_error",
            CaskError::Transaction(_) => "transaction_error",
            CaskError::Query(_) => "query_error",
        }
    }

    /// True for the recoverable "no such record" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaskError::NotFound(_))
    }

    pub(crate) fn not_found(key: &[u8]) -> Self {
        CaskError::NotFound(format!("no record for key {}", display_key(key)))
    }

    pub(crate) fn read_only() -> Self {
        CaskError::InvalidOperation("database was opened without the writer mode".into())
    }
}

impl From<std::io::Error> for CaskError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => CaskError::Lock(err.to_string()),
            _ => CaskError::Io(err.to_string()),
        }
    }
}

impl From<bincode::Error> for CaskError {
    fn from(err: bincode::Error) -> Self {
        CaskError::Corrupt(err.to_string())
    }
}

/// Render a key for error messages, lossy for binary keys.
pub(crate) fn display_key(key: &[u8]) -> String {
    const LIMIT: usize = 64;
    let shown = &key[..key.len().min(LIMIT)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if key.len() > LIMIT {
        text.push_str("...");
    }
    format!("{text:?}")
}
