use thiserror::Error;
use crate::peer::LogicalAddr;

/// Outcome classes of connection management.
///
/// `TryAgain` is not a failure: it is the standing status of a connection that is being
///  established. `InvariantViolation` on the other hand is never a routine condition: it
///  indicates a logic defect or corrupted state and should be treated as fatal by diagnostic
///  builds and tests.
#[derive(Error, Debug)]
pub enum CmError {
    #[error("no free connection entry")]
    NoMemory,
    #[error("peer index {0} can not be stored in the connection table")]
    IndexExhausted(usize),
    #[error("logical address {0:?} does not resolve to a peer")]
    UnknownAddress(LogicalAddr),
    #[error("connection is not established yet, try again")]
    TryAgain,
    #[error("transport operation '{op}' failed: {source}")]
    Transport {
        op: &'static str,
        source: anyhow::Error,
    },
    #[error("malformed handshake: {0}")]
    MalformedHandshake(anyhow::Error),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl CmError {
    pub fn transport(op: &'static str, source: anyhow::Error) -> CmError {
        CmError::Transport { op, source }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CmError::TryAgain)
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, CmError::InvariantViolation(_))
    }
}
