//! Error types shared by the store, the sysfs layer and the reconciler.

use std::io;

use thiserror::Error;

/// Error type covering every failure mode of the authorization core.
#[derive(Debug, Error)]
pub enum Error {
    /// A record, key or attached device is absent. Often expected.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// An open, read, write or close failed.
    #[error("{context}: {source}")]
    Io {
        /// The operation that failed, including the path involved.
        context: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A persisted record exists but cannot be interpreted.
    #[error("corrupt record for {uid}: {reason}")]
    Corrupt {
        /// The uid whose record is malformed.
        uid: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A privileged operation was attempted without privilege.
    #[error("permission denied: {operation} requires root")]
    PermissionDenied {
        /// The operation that was refused.
        operation: String,
    },

    /// A token does not name any variant of an enumeration.
    #[error("invalid {kind} token: {token:?}")]
    InvalidToken {
        /// The enumeration being parsed.
        kind: &'static str,
        /// The offending input.
        token: String,
    },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Like [`Error::io`], but a missing file becomes [`Error::NotFound`].
    pub fn io_or_not_found(
        what: impl Into<String>,
        context: impl Into<String>,
        source: io::Error,
    ) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::NotFound { what: what.into() }
        } else {
            Error::io(context, source)
        }
    }

    /// Creates a [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Creates a [`Error::Corrupt`].
    pub fn corrupt(uid: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            uid: uid.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for the recoverable "absent" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if a persisted record could not be interpreted.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::Corrupt { .. })
    }

    /// The OS error code carried by an [`Error::Io`], if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
