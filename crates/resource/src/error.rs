use comb_interfaces::{BlockSourceError, OwnerValidatorError, SignerError, StoreError};

/// Result alias for [`ResourceError`].
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors produced by the mutable resource engine.
///
/// Variants are the stable tags callers may branch on; the payload is a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// No resource or update exists at the queried location.
    #[error("not found: {0}")]
    NotFound(String),
    /// Transient storage or network failure, including timeouts.
    #[error("io: {0}")]
    Io(String),
    /// The recovered signer is not the owner of the resource name.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A caller-supplied argument violates a stated constraint.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Payload plus headers would exceed one chunk.
    #[error("data overflow: {0}")]
    DataOverflow(String),
    /// Parsing produced no meaningful result: malformed input, a mismatched
    /// name, or the history boundary was reached.
    #[error("nothing to return: {0}")]
    NothingToReturn(String),
    /// Signing failed or produced an unrecoverable signature.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// The operation requires a resource whose index entry has been synced.
    #[error("not synced: {0}")]
    NotSynced(String),
    /// Lookup exceeded the configured maximum number of period hops.
    #[error("period depth: {0}")]
    PeriodDepth(String),
    /// A structural check failed mid-parse.
    #[error("corrupt data: {0}")]
    CorruptData(String),
    /// No chunk store is bound to the handler.
    #[error("not initialized: {0}")]
    Init(String),
}

impl From<BlockSourceError> for ResourceError {
    fn from(err: BlockSourceError) -> Self {
        Self::Io(format!("could not get block height: {err}"))
    }
}

impl From<StoreError> for ResourceError {
    fn from(err: StoreError) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<SignerError> for ResourceError {
    fn from(err: SignerError) -> Self {
        Self::InvalidSignature(err.to_string())
    }
}

impl From<OwnerValidatorError> for ResourceError {
    fn from(err: OwnerValidatorError) -> Self {
        Self::Io(format!("access check fail: {err}"))
    }
}
