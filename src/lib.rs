//! Ronin Quest SDK - quest progress synchronization engine
//!
//! Client-side engine for the Ronin's Pact: a player proves three independent
//! trials (Technique, Wisdom, Spirit) and each completion is recorded as a
//! write against a remote, eventually-consistent ledger.
//!
//! # Architecture
//!
//! - **IdentityResolver**: which record (token) belongs to the owner, via the
//!   mint event or a bounded ownership scan
//! - **ProgressStore**: one atomic `Progress` snapshot blending confirmed
//!   ledger state with an optimistic overlay
//! - **CompletionTracker**: submit, pending, then confirmed or failed, racing the
//!   write receipt against the event feed and a timeout
//! - **TimeLockGate**: eligibility window of the time-locked Spirit trial
//! - **AnswerCommitment**: domain-separated hash commitments for the Wisdom quiz
//!
//! The engine only talks to the ledger through `LedgerGateway` and
//! `SessionSigner`. `InMemoryLedger` is a complete in-process ledger with
//! fault injection for tests and local play.
//!
//! # Example
//!
//! ```rust,ignore
//! use ronin_quest_sdk::{GatewaySigner, InMemoryLedger, QuestClient, QuestConfig, TrialPayload};
//!
//! let ledger = Arc::new(InMemoryLedger::new());
//! let client = QuestClient::new(ledger.clone(), QuestConfig::default())?;
//!
//! let signer = Arc::new(GatewaySigner::new(player, ledger));
//! client.connect(signer).await?;
//! client.mint().await?;
//!
//! let handle = client.submit(TrialPayload::Spirit { vow: "I walk the path".into() })?;
//! handle.outcome().await?;
//! ```

// Ledger and signer interfaces
pub mod traits;

// In-process ledger
pub mod ledger;

// Record identity resolution
pub mod identity;

// Aggregate progress state
pub mod store;

// Per-trial write lifecycle
pub mod tracker;

// Time-locked trial gate
pub mod timelock;

// Quiz answer commitments
pub mod commitment;

// Session client
pub mod client;

pub mod config;
pub mod error;
pub mod types;

// Re-export interfaces
pub use traits::{
    EventFilter, EventStream, GatewaySigner, LedgerCall, LedgerEvent, LedgerGateway, LedgerQuery,
    LedgerValue, Receipt, ReceiptStatus, SessionSigner, TrialPayload,
};

// Re-export engine types
pub use client::QuestClient;
pub use commitment::{
    commit, AnswerKey, Commitment, DisplayedQuestion, Question, QuestionBank, QuestionId,
    QuizAttempt, SealedAnswers,
};
pub use identity::{IdentityResolver, RecordIdentity};
pub use ledger::{InMemoryLedger, LedgerFaults};
pub use store::{Progress, ProgressStore, ProgressUpdate, TrialSlot, TrialStatus};
pub use timelock::{TimeLockStatus, TimeLockWindow};
pub use tracker::{
    AttemptHandle, AttemptOrigin, AttemptStatus, CompletionAttempt, CompletionTracker,
    CompletionTrackers, ConfirmationSource, FailureReason,
};
pub use types::{Address, RecordId, Timestamp, TrialFlags, TrialKind};

// Re-export config and errors
pub use config::{IdentityConfig, QuestConfig, TrackerConfig};
pub use error::{GatewayError, QuestError, RejectReason, Result};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
