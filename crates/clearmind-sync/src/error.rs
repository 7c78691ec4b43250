//! Error types for the ClearMind sync engine

use thiserror::Error;

/// Coarse classification used by callers to decide how to message a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the operation may succeed later without changes
    Connectivity,
    /// Permanent; bad input or a uniqueness violation
    Validation,
    /// Permanent; bad credentials or missing identity
    Authentication,
    /// A local record does not exist
    NotFound,
    /// Local persistence failed
    Storage,
}

/// Main error type for sync engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote service could not be reached (offline, timeout, 5xx)
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Input rejected locally or by the server
    #[error("Validation error: {0}")]
    Validation(String),

    /// An account with this email already exists
    #[error("Email already registered: {0}")]
    DuplicateEmail(String),

    /// Email/password pair was rejected
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// No account with this email exists on this device
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The operation needs a signed-in identity
    #[error("No active identity")]
    Unauthenticated,

    /// Local record was not found (or belongs to another user)
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Password hashing or verification failed for a reason other than mismatch
    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Map this error onto the transient/permanent taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connectivity(_) => ErrorKind::Connectivity,
            SyncError::Validation(_)
            | SyncError::DuplicateEmail(_)
            | SyncError::Config(_)
            | SyncError::InvalidOperation(_) => ErrorKind::Validation,
            SyncError::InvalidCredentials | SyncError::Unauthenticated => {
                ErrorKind::Authentication
            }
            SyncError::UserNotFound(_) | SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Storage(_)
            | SyncError::Database(_)
            | SyncError::Transaction(_)
            | SyncError::Table(_)
            | SyncError::StorageOp(_)
            | SyncError::Commit(_)
            | SyncError::Serialization(_)
            | SyncError::Io(_)
            | SyncError::PasswordHash(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for SyncError {
    fn from(err: postcard::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
