//! Ledger gateway contract: async read, write and subscribe

use crate::commitment::SealedAnswers;
use crate::error::{GatewayError, QuestError, RejectReason, Result};
use crate::types::{Address, RecordId, Timestamp, TrialFlags, TrialKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Receiving end of a ledger subscription
pub type EventStream = mpsc::Receiver<LedgerEvent>;

/// Read-only queries against derived ledger state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerQuery {
    /// Number of records owned by an address
    BalanceOf(Address),
    /// Current owner of a record
    OwnerOf(RecordId),
    /// Per-trial completion flags of a record
    Progress(RecordId),
    /// Mint timestamp of a record
    CreatedAt(RecordId),
    /// Configured Spirit trial lock, in seconds
    TimeLockDuration,
}

impl std::fmt::Display for LedgerQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BalanceOf(owner) => write!(f, "balance_of({})", owner),
            Self::OwnerOf(id) => write!(f, "owner_of({})", id),
            Self::Progress(id) => write!(f, "get_progress({})", id),
            Self::CreatedAt(id) => write!(f, "created_at({})", id),
            Self::TimeLockDuration => write!(f, "time_lock_duration"),
        }
    }
}

/// Answer to a `LedgerQuery`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerValue {
    Count(u64),
    Owner(Option<Address>),
    Progress(TrialFlags),
    Timestamp(Timestamp),
    Seconds(u64),
}

impl LedgerValue {
    fn unexpected(query: &LedgerQuery, value: &LedgerValue) -> QuestError {
        QuestError::UnexpectedValue {
            query: query.to_string(),
            value: format!("{:?}", value),
        }
    }

    pub fn into_count(self, query: &LedgerQuery) -> Result<u64> {
        match self {
            Self::Count(n) => Ok(n),
            other => Err(Self::unexpected(query, &other)),
        }
    }

    pub fn into_owner(self, query: &LedgerQuery) -> Result<Option<Address>> {
        match self {
            Self::Owner(owner) => Ok(owner),
            other => Err(Self::unexpected(query, &other)),
        }
    }

    pub fn into_progress(self, query: &LedgerQuery) -> Result<TrialFlags> {
        match self {
            Self::Progress(flags) => Ok(flags),
            other => Err(Self::unexpected(query, &other)),
        }
    }

    pub fn into_timestamp(self, query: &LedgerQuery) -> Result<Timestamp> {
        match self {
            Self::Timestamp(ts) => Ok(ts),
            other => Err(Self::unexpected(query, &other)),
        }
    }

    pub fn into_seconds(self, query: &LedgerQuery) -> Result<u64> {
        match self {
            Self::Seconds(secs) => Ok(secs),
            other => Err(Self::unexpected(query, &other)),
        }
    }
}

/// Proof submitted with a trial completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trial")]
pub enum TrialPayload {
    /// Ownership of a token from an allow-listed game collection
    Technique { collection: Address },
    /// Stable question ids and answer commitments
    Wisdom { answers: SealedAnswers },
    /// The player's written vow
    Spirit { vow: String },
}

impl TrialPayload {
    pub fn trial(&self) -> TrialKind {
        match self {
            Self::Technique { .. } => TrialKind::Technique,
            Self::Wisdom { .. } => TrialKind::Wisdom,
            Self::Spirit { .. } => TrialKind::Spirit,
        }
    }

    /// Local shape checks; pass/fail is decided by the ledger
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Technique { collection } if collection.as_str().is_empty() => {
                Err(QuestError::InvalidAnswers("collection address required".into()))
            }
            Self::Wisdom { answers } if answers.is_empty() => {
                Err(QuestError::InvalidAnswers("at least one answer required".into()))
            }
            Self::Spirit { vow } if vow.trim().is_empty() => {
                Err(QuestError::InvalidAnswers("vow must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A state-changing call submitted by the session signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCall {
    /// Mint a quest record for the caller
    Mint,
    /// Record completion of one trial
    CompleteTrial {
        record_id: RecordId,
        payload: TrialPayload,
    },
}

impl LedgerCall {
    pub fn entrypoint(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::CompleteTrial { payload, .. } => match payload.trial() {
                TrialKind::Technique => "complete_waza",
                TrialKind::Wisdom => "complete_chi",
                TrialKind::Spirit => "complete_shin",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Accepted,
    Reverted(RejectReason),
}

/// Acknowledgment of a submitted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub status: ReceiptStatus,
}

impl Receipt {
    pub fn accepted(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            status: ReceiptStatus::Accepted,
        }
    }

    /// Fold a reverted receipt into the error path
    pub fn into_result(self) -> std::result::Result<Receipt, GatewayError> {
        match self.status {
            ReceiptStatus::Accepted => Ok(self),
            ReceiptStatus::Reverted(reason) => Err(GatewayError::Rejected(reason)),
        }
    }
}

/// Durable events emitted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LedgerEvent {
    RecordMinted {
        owner: Address,
        record_id: RecordId,
        created_at: Timestamp,
    },
    TrialCompleted {
        record_id: RecordId,
        trial: TrialKind,
        tx_hash: String,
    },
}

/// Selects the events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    /// Mints for one owner
    MintedBy(Address),
    /// Every trial completion of one record
    CompletionsOf(RecordId),
}

impl EventFilter {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        match (self, event) {
            (Self::MintedBy(wanted), LedgerEvent::RecordMinted { owner, .. }) => wanted == owner,
            (Self::CompletionsOf(wanted), LedgerEvent::TrialCompleted { record_id, .. }) => {
                wanted == record_id
            }
            _ => false,
        }
    }
}

/// Uniform async access to the ledger.
///
/// Implementations must be safe for concurrent calls. `write` may be slow or
/// fail even though the state change eventually lands, and a subscription may
/// deliver events before, with, or after the receipt of the write that caused
/// them. Subscriptions may start by replaying historical matching events.
///
/// # Example
///
/// ```rust,ignore
/// use ronin_quest_sdk::{LedgerGateway, LedgerQuery};
///
/// let query = LedgerQuery::BalanceOf(owner.clone());
/// let balance = gateway.read(&query).await?.into_count(&query)?;
/// ```
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Read derived state
    async fn read(&self, query: &LedgerQuery) -> std::result::Result<LedgerValue, GatewayError>;

    /// Submit a call on behalf of `caller` and wait for its receipt
    async fn write(
        &self,
        caller: &Address,
        call: &LedgerCall,
    ) -> std::result::Result<Receipt, GatewayError>;

    /// Open an event subscription
    async fn subscribe(&self, filter: EventFilter) -> std::result::Result<EventStream, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let owner = Address::new("0xa11ce");
        let minted = LedgerEvent::RecordMinted {
            owner: owner.clone(),
            record_id: RecordId(7),
            created_at: 0,
        };
        let completed = LedgerEvent::TrialCompleted {
            record_id: RecordId(7),
            trial: TrialKind::Wisdom,
            tx_hash: "0x1".into(),
        };

        assert!(EventFilter::MintedBy(owner.clone()).matches(&minted));
        assert!(!EventFilter::MintedBy(Address::new("0xb0b")).matches(&minted));
        assert!(EventFilter::CompletionsOf(RecordId(7)).matches(&completed));
        assert!(!EventFilter::CompletionsOf(RecordId(8)).matches(&completed));
        assert!(!EventFilter::MintedBy(owner).matches(&completed));
    }

    #[test]
    fn test_value_shape_mismatch() {
        let query = LedgerQuery::BalanceOf(Address::new("0x1"));
        let err = LedgerValue::Seconds(3).into_count(&query).unwrap_err();
        assert!(matches!(err, QuestError::UnexpectedValue { .. }));
    }

    #[test]
    fn test_payload_validation() {
        assert!(TrialPayload::Spirit { vow: "  ".into() }.validate().is_err());
        assert!(TrialPayload::Spirit { vow: "I pledge".into() }.validate().is_ok());
        assert_eq!(
            LedgerCall::CompleteTrial {
                record_id: RecordId(1),
                payload: TrialPayload::Spirit { vow: "x".into() },
            }
            .entrypoint(),
            "complete_shin"
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = LedgerEvent::TrialCompleted {
            record_id: RecordId(3),
            trial: TrialKind::Spirit,
            tx_hash: "0xabc".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"trial_completed\""));
        assert!(json.contains("\"trial\":\"spirit\""));
    }
}
