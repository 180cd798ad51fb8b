use thiserror::Error;

/// Failure classes that callers act on differently.
///
/// These travel inside `anyhow::Error`; code that needs to tell them apart uses
/// `downcast_ref::<Error>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Retried I/O failure that never succeeded.
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("source mismatch: {0}")]
    SourceMismatch(String),

    /// Hash or size mismatch of stored or restored data.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("malformed manifest: {0}")]
    ManifestParse(String),

    #[error("block not found in any volume: {0}")]
    BlockNotFound(String),

    /// Repository state that cannot be interpreted unambiguously.
    #[error("inconsistent repository state: {0}")]
    Consistency(String),

    /// The batch completed but some entries were skipped.
    #[error("{0} entries failed")]
    PartialFailure(u64),
}
