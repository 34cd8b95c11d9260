//! Error types for the backup pipeline

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide between retry, heal, surface and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Supplier offline, send timeout, fetch not-found. Retried with backoff.
    Transient,
    /// A fragment is missing or damaged but the block is still recoverable.
    Correctable,
    /// Fragments are missing beyond the ecc threshold.
    AtRisk,
    /// Reading or writing a local fragment or block file failed.
    LocalIo,
    /// Encryption or key failure. Fatal for the block.
    Crypto,
    /// Bad configuration. Fatal at startup.
    Configuration,
    /// Work was cancelled on request.
    Cancelled,
    /// Bug or broken invariant.
    Internal,
}

/// Errors that can occur in the backup pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Unknown ECC scheme name
    #[error("Unknown ECC scheme: {0}")]
    UnknownEccScheme(String),

    /// Not enough fragments to reassemble a block
    #[error(
        "Insufficient fragments for block {block_number}: have {available}, need {required}"
    )]
    InsufficientFragments {
        block_number: u64,
        available: usize,
        required: usize,
    },

    /// Fragment content does not match its checksum
    #[error("Checksum mismatch for fragment {fragment}")]
    ChecksumMismatch { fragment: String },

    /// Block or fragment bytes could not be parsed
    #[error("Malformed block data: {0}")]
    BlockFormat(String),

    // =========================================================================
    // Raid Worker Errors
    // =========================================================================
    /// Task was cancelled before or during execution
    #[error("Task cancelled")]
    Cancelled,

    /// Raid pool no longer accepts work
    #[error("Raid worker is shut down")]
    WorkerShutdown,

    // =========================================================================
    // Pipe Errors
    // =========================================================================
    /// A second reader tried to read while one is pending
    #[error("Pipe already has a pending reader")]
    AlreadyReading,

    /// Pipe was closed or fully drained
    #[error("Pipe is closed")]
    PipeClosed,

    // =========================================================================
    // Crypto Errors
    // =========================================================================
    /// Encryption, decryption or key unwrapping failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    // =========================================================================
    // Supplier Errors
    // =========================================================================
    /// Supplier cannot be reached
    #[error("Supplier {supplier} is unavailable: {reason}")]
    SupplierUnavailable { supplier: String, reason: String },

    /// Supplier did not answer in time
    #[error("Supplier {supplier} timed out on {operation}")]
    SendTimeout { supplier: String, operation: String },

    /// Supplier explicitly refused a request
    #[error("Supplier {supplier} rejected {fragment}: {reason}")]
    SupplierRejected {
        supplier: String,
        fragment: String,
        reason: String,
    },

    /// Fragment not present where it was looked up
    #[error("Fragment not found: {0}")]
    FragmentNotFound(String),

    // =========================================================================
    // Matrix / Catalog Errors
    // =========================================================================
    /// A presence change would break a matrix invariant
    #[error("Fragment matrix invariant violated: {0}")]
    MatrixInvariant(String),

    /// Backup is not known to the catalog
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Backup identifier could not be parsed
    #[error("Invalid backup id '{0}': expected customer:path/version")]
    InvalidBackupId(String),

    /// Persisted state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SupplierUnavailable { .. }
            | Error::SendTimeout { .. }
            | Error::SupplierRejected { .. }
            | Error::FragmentNotFound(_) => ErrorKind::Transient,
            Error::ChecksumMismatch { .. } => ErrorKind::Correctable,
            Error::InsufficientFragments { .. } => ErrorKind::AtRisk,
            Error::Io(_) | Error::BlockFormat(_) => ErrorKind::LocalIo,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Config(_) | Error::UnknownEccScheme(_) | Error::InvalidBackupId(_) => {
                ErrorKind::Configuration
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_)
            | Error::WorkerShutdown
            | Error::AlreadyReading
            | Error::PipeClosed
            | Error::MatrixInvariant(_)
            | Error::BackupNotFound(_)
            | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the error must stop the owning backup or restore.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Crypto | ErrorKind::Configuration | ErrorKind::LocalIo | ErrorKind::AtRisk
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let transient = Error::SupplierUnavailable {
            supplier: "s1".into(),
            reason: "offline".into(),
        };
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());

        let insufficient = Error::InsufficientFragments {
            block_number: 3,
            available: 4,
            required: 18,
        };
        assert_eq!(insufficient.kind(), ErrorKind::AtRisk);
        assert!(insufficient.is_fatal());

        assert_eq!(Error::Crypto("bad tag".into()).kind(), ErrorKind::Crypto);
        assert_eq!(
            Error::UnknownEccScheme("3x3".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_io_errors_are_local_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
    }

    #[test]
    fn test_error_display() {
        let err = Error::InsufficientFragments {
            block_number: 0,
            available: 8,
            required: 18,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient fragments for block 0: have 8, need 18"
        );
    }
}
