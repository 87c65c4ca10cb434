use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the storage core.
///
/// `Logic`/`InvariantViolation` indicate a contract was violated by the
/// caller or by a bug in this crate; they are never recoverable within the
/// transaction that raised them. `Io` and `Capacity` are environment
/// failures: the caller must roll back the current transaction. `Recovery`
/// only surfaces from `Wal::recover`, at database-open time, before any
/// transaction exists.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logic error: {0}")]
    Logic(&'static str),

    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    #[error("recovery error: {0}")]
    Recovery(&'static str),

    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    #[error("malformed wal record: {0}")]
    MalformedWalRecord(&'static str),
}
