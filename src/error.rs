//! Error types for the quest SDK

use crate::types::{Address, TrialKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, QuestError>;

/// Why the ledger refused a write.
///
/// `Display` renders the ledger's own wording so the UI can show it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum RejectReason {
    /// The time-gated trial was attempted before its window opened
    TimeLockActive,
    /// The signer does not own the record
    NotOwner,
    /// The trial is already recorded for this record
    AlreadyCompleted,
    /// Quiz commitments did not meet the ledger's pass rule
    IncorrectAnswers,
    /// No record exists with the given id
    UnknownRecord,
    /// Anything the ledger reported that has no dedicated variant
    Other(String),
}

impl RejectReason {
    /// Classify a raw revert message coming back from the ledger.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("time lock") || lower.contains("timelock") {
            Self::TimeLockActive
        } else if lower.contains("not owner") || lower.contains("not registered") {
            Self::NotOwner
        } else if lower.contains("already completed") {
            Self::AlreadyCompleted
        } else if lower.contains("incorrect") || lower.contains("wrong answer") {
            Self::IncorrectAnswers
        } else if lower.contains("unknown token") || lower.contains("unknown record") {
            Self::UnknownRecord
        } else {
            Self::Other(message.to_string())
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeLockActive => write!(f, "time lock not elapsed"),
            Self::NotOwner => write!(f, "caller is not owner of the record"),
            Self::AlreadyCompleted => write!(f, "trial already completed"),
            Self::IncorrectAnswers => write!(f, "incorrect answers"),
            Self::UnknownRecord => write!(f, "unknown record"),
            Self::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Failure reported by a `LedgerGateway` or `SessionSigner`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The ledger processed the call and refused it
    #[error("Rejected: {0}")]
    Rejected(RejectReason),

    /// The call never got a definite answer from the ledger
    #[error("Transport error: {0}")]
    Transport(String),
}

/// SDK error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestError {
    /// No record found for the owner within the bounded scan
    #[error("No quest record found for {owner} after scanning {scanned} ids")]
    IdentityUnresolved { owner: Address, scanned: u64 },

    /// The operation needs a bound record and none is bound yet
    #[error("No quest record is bound to the session")]
    NotResolved,

    /// A live attempt already exists for this trial
    #[error("A {trial} completion is already pending")]
    AlreadyPending { trial: TrialKind },

    /// The ledger explicitly refused the write
    #[error("Rejected: {0}")]
    Rejected(RejectReason),

    /// No confirmation was observed inside the bounded window
    #[error("No confirmation for {trial} after {waited_ms}ms")]
    Timeout { trial: TrialKind, waited_ms: u64 },

    /// The gateway itself failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session ended while the operation was outstanding
    #[error("Session disconnected")]
    Disconnected,

    /// The gateway answered a read with a value of the wrong shape
    #[error("Unexpected value for {query}: {value}")]
    UnexpectedValue { query: String, value: String },

    /// Quiz answers could not be sealed
    #[error("Invalid answers: {0}")]
    InvalidAnswers(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<GatewayError> for QuestError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(reason) => QuestError::Rejected(reason),
            GatewayError::Transport(message) => QuestError::Transport(message),
        }
    }
}

impl From<toml::de::Error> for QuestError {
    fn from(err: toml::de::Error) -> Self {
        QuestError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_reverts() {
        assert_eq!(
            RejectReason::classify("Shin: time lock not elapsed"),
            RejectReason::TimeLockActive
        );
        assert_eq!(
            RejectReason::classify("Trial already completed"),
            RejectReason::AlreadyCompleted
        );
        assert_eq!(
            RejectReason::classify("out of gas"),
            RejectReason::Other("out of gas".to_string())
        );
    }

    #[test]
    fn test_gateway_error_keeps_classification() {
        let err: QuestError = GatewayError::Rejected(RejectReason::TimeLockActive).into();
        assert_eq!(err, QuestError::Rejected(RejectReason::TimeLockActive));
        assert_eq!(err.to_string(), "Rejected: time lock not elapsed");
    }
}
