//! Error types and error codes for kvlease
//!
//! This module defines:
//! - `KvError`: the error taxonomy shared by the CAS engine, the lease lock and
//!   the tree deletion retrier
//! - `ErrorCode`: structured codes for operator-facing output

use serde::{Deserialize, Serialize};

/// Errors surfaced by store and lock operations
#[derive(thiserror::Error, Debug)]
pub enum KvError {
    /// The key is absent or logically expired
    #[error("key not found in store")]
    KeyNotFound,

    /// A "must be absent" precondition found a live item
    #[error("key exists in store")]
    KeyExists,

    /// The revision (fencing token) did not match, or the lease it guarded expired
    #[error("unable to complete atomic operation, key modified")]
    KeyModified,

    /// The caller cancelled before the lock was obtained
    #[error("stop called before lock was acquired")]
    AcquireCancelled,

    /// `lock` was called on a handle whose previous cycle is still held
    #[error("lock '{0}' is already held by this handle")]
    AlreadyHeld(String),

    /// The batch delete did not drain before its deadline
    #[error("delete batch timed out with {} keys unprocessed", unprocessed.len())]
    DeleteTreeTimeout { unprocessed: Vec<String> },

    /// A prefix scan exceeded its time budget
    #[error("scan of prefix '{0}' timed out")]
    ScanTimeout(String),

    #[error("call not supported by this store")]
    CallNotSupported,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Opaque failure reported by the backing store
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    /// Errors that mean "someone else owns the key right now"
    ///
    /// These are recovered by the acquire loop and treated as lease loss by the
    /// renewal loop.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            KvError::KeyNotFound | KvError::KeyExists | KvError::KeyModified
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::KeyNotFound)
    }

    /// Build a backend error from a plain message
    pub fn backend(message: impl std::fmt::Display) -> Self {
        KvError::Backend(anyhow::anyhow!("{}", message))
    }

    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            KvError::KeyNotFound => KEY_NOT_FOUND,
            KvError::KeyExists => KEY_EXISTS,
            KvError::KeyModified => KEY_MODIFIED,
            KvError::AcquireCancelled => ACQUIRE_CANCELLED,
            KvError::AlreadyHeld(_) => ALREADY_HELD,
            KvError::DeleteTreeTimeout { .. } => DELETE_TREE_TIMEOUT,
            KvError::ScanTimeout(_) => SCAN_TIMEOUT,
            KvError::CallNotSupported => CALL_NOT_SUPPORTED,
            KvError::InvalidConfiguration(_) => INVALID_CONFIGURATION,
            KvError::Backend(_) => BACKEND_ERROR,
        }
    }
}

/// Error code structure for operator-facing output
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

// Conditional write outcomes
pub const KEY_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 20004,
    message: "key not found",
};

pub const KEY_EXISTS: ErrorCode<'static> = ErrorCode {
    code: 20005,
    message: "key exists",
};

pub const KEY_MODIFIED: ErrorCode<'static> = ErrorCode {
    code: 20006,
    message: "key modified",
};

// Lock lifecycle
pub const ACQUIRE_CANCELLED: ErrorCode<'static> = ErrorCode {
    code: 23000,
    message: "lock acquire cancelled",
};

pub const ALREADY_HELD: ErrorCode<'static> = ErrorCode {
    code: 23001,
    message: "lock already held",
};

// Bulk operations
pub const DELETE_TREE_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 24000,
    message: "delete tree timed out",
};

pub const SCAN_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 24001,
    message: "scan timed out",
};

pub const CALL_NOT_SUPPORTED: ErrorCode<'static> = ErrorCode {
    code: 40001,
    message: "call not supported",
};

pub const INVALID_CONFIGURATION: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "invalid configuration",
};

pub const BACKEND_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "backend error",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_display() {
        assert_eq!(KvError::KeyNotFound.to_string(), "key not found in store");
        assert_eq!(
            KvError::AcquireCancelled.to_string(),
            "stop called before lock was acquired"
        );

        let err = KvError::DeleteTreeTimeout {
            unprocessed: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "delete batch timed out with 2 keys unprocessed");

        let err = KvError::backend("throttled");
        assert_eq!(err.to_string(), "backend error: throttled");
    }

    #[test]
    fn test_conflict_classification() {
        assert!(KvError::KeyNotFound.is_conflict());
        assert!(KvError::KeyExists.is_conflict());
        assert!(KvError::KeyModified.is_conflict());
        assert!(!KvError::AcquireCancelled.is_conflict());
        assert!(!KvError::backend("boom").is_conflict());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SUCCESS.code, 0);
        assert_eq!(KvError::KeyModified.error_code(), KEY_MODIFIED);
        assert_eq!(KvError::CallNotSupported.error_code().code, 40001);
        assert_eq!(
            KvError::DeleteTreeTimeout {
                unprocessed: Vec::new()
            }
            .error_code(),
            DELETE_TREE_TIMEOUT
        );
    }

    #[test]
    fn test_from_anyhow() {
        let err: KvError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, KvError::Backend(_)));
    }
}
