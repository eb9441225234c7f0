//! Error kinds (spec.md §7) and the wire-level status codes they map to.

use thiserror::Error;

/// Per-transaction outcome for commit/rollback, distinct from a hard error:
/// a delayed commit is not a failure, it's a request to retry.
pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = -1;
pub const STATUS_DELAYED: i32 = 1;

#[derive(Error, Debug)]
pub enum GtmError {
    /// Malformed frame or truncated payload. Fatal for the connection;
    /// no state mutation has happened when this is raised.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid transaction handle")]
    InvalidHandle,

    #[error("unknown gxid")]
    UnknownGxid,

    #[error("unknown gid")]
    UnknownGid,

    #[error("invalid isolation level: {0}")]
    InvalidIsolation(String),

    #[error("no free transaction slot")]
    Capacity,

    #[error("gtm is shutting down")]
    ShuttingDown,

    #[error("this node is running as a standby")]
    StandbyMode,

    #[error("transaction id wraparound limit reached, refusing to allocate")]
    WraparoundStop,

    #[error("gid already bound to an open transaction")]
    DuplicateGid,

    #[error("standby replication unavailable")]
    ReplicationUnavailable,

    /// A precondition the caller is responsible for (e.g. `prepare` called
    /// on a slot not in `PREPARE_IN_PROGRESS`) was violated. Distinguished
    /// from client-triggerable validation errors because it indicates the
    /// transaction manager's own invariants were broken by a caller.
    #[error("invariant violated: {0}")]
    FatalInvariant(String),

    #[error("control file error: {0}")]
    ControlFile(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GtmError {
    /// Wire-level status code carried in the error response body. Protocol
    /// errors never reach this: the connection is closed before a response
    /// is framed.
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        STATUS_ERROR
    }
}

pub type GtmResult<T> = std::result::Result<T, GtmError>;
