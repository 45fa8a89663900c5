//! Error taxonomy for the engine.

use crate::keys::FeedId;

/// Result alias using the crate [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
///
/// Classification matters for propagation: [`Error::Corrupt`] on locally
/// stored data halts the affected space, while the same condition on data
/// received from a remote peer is skip-and-log at the replication layer.
/// [`Error::Cancelled`] is always propagated, never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Attempted append without write authority for the feed.
    #[error("append without write authority")]
    NotOwner {
        /// The feed the append targeted, if one was resolved.
        feed: Option<FeedId>,
    },
    /// Stored data failed validation (bad signature, truncation, checksum
    /// mismatch). Fatal for the affected space when local.
    #[error("corrupt storage: {reason}")]
    Corrupt {
        /// What failed to validate.
        reason: String,
    },
    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// No peer is currently reachable to serve the request.
    #[error("no peer available")]
    Unavailable,
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// A block arrived ahead of the next expected index for its feed.
    #[error("out of order block for feed {}: got {index}, expected {expected}", .feed.fmt_short())]
    OutOfOrder {
        /// Feed the block belongs to.
        feed: FeedId,
        /// Index carried by the block.
        index: u64,
        /// Next index the local log would accept.
        expected: u64,
    },
    /// The component has been shut down.
    #[error("closed")]
    Closed,
    /// I/O failure from the underlying storage. Fatal for the space.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Failure in the embedded database. Fatal for the space.
    #[error("storage: {0}")]
    Storage(#[from] redb::Error),
    /// Serialization failure.
    #[error("encoding: {0}")]
    Encoding(#[from] postcard::Error),
}

impl Error {
    /// Shorthand for a [`Error::Corrupt`] with the given reason.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }

    /// Whether this error must halt the space when it originates from local
    /// storage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corrupt { .. } | Error::Io(_) | Error::Storage(_)
        )
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Self::Storage(value.into())
    }
}
