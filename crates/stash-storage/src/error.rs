//! Storage error types.
//!
//! Every backend reports through [`StorageError`]. Only two outcomes are
//! part of the domain vocabulary, [`StorageError::Conflict`] and
//! [`StorageError::NotFound`]; everything else is a failure of the
//! underlying medium and is classified as [`ErrorKind::Unexpected`].
//!
//! Each variant carries enough context (operation, key, reason) to diagnose
//! the problem from a log line without a debugger.

/// Result alias used throughout the storage crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A live record already exists for the key.
    #[error("conflict: key '{key}' already holds a live record")]
    Conflict { key: String },

    /// No live record exists for the key. Expired records are reported the
    /// same way as records that never existed.
    #[error("not found: key '{key}'")]
    NotFound { key: String },

    /// A streaming transfer was aborted by its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The key cannot be represented by this backend's medium.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Backend configuration failed validation at construction time.
    #[error("invalid backend configuration: {reason}")]
    Config { reason: String },

    /// Failed to open or connect to the storage medium.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key from storage.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// The TTL envelope in front of a stored payload could not be decoded.
    #[error("invalid ttl header: {reason}")]
    Header { reason: String },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A decorator could not encode or decode its payload envelope
    /// (for example, authenticated decryption failed).
    #[error("payload codec failed for key '{key}': {reason}")]
    Codec { key: String, reason: String },
}

/// Coarse classification of a [`StorageError`], used by callers that map
/// storage outcomes onto their own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A live record already exists.
    Conflict,
    /// No live record exists.
    NotFound,
    /// Any failure of the medium, codec, or configuration.
    Unexpected,
}

impl ErrorKind {
    /// HTTP status code conventionally associated with this kind.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::Unexpected => 500,
        }
    }
}

impl StorageError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Unexpected,
        }
    }

    /// Whether this is a [`StorageError::Conflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Whether this is a [`StorageError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn conflict(key: &str) -> Self {
        Self::Conflict {
            key: key.to_owned(),
        }
    }

    pub(crate) fn not_found(key: &str) -> Self {
        Self::NotFound {
            key: key.to_owned(),
        }
    }

    /// Map an I/O error raised while streaming a payload for `key`.
    ///
    /// Errors produced by a cancelled [`CancelReader`](crate::CancelReader)
    /// become [`StorageError::Cancelled`]; everything else is wrapped by
    /// `wrap` with the key and the error text.
    pub(crate) fn from_stream_io(
        key: &str,
        err: &std::io::Error,
        wrap: fn(String, String) -> Self,
    ) -> Self {
        if crate::cancel::is_cancelled_io(err) {
            Self::Cancelled
        } else {
            wrap(key.to_owned(), err.to_string())
        }
    }

    pub(crate) fn write(key: String, reason: String) -> Self {
        Self::Write { key, reason }
    }
}
