//! Attempt lifecycle values and the caller-facing handle

use crate::error::{QuestError, RejectReason, Result};
use crate::types::{RecordId, Timestamp, TrialKind};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Channel that proved the completion landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// The write's own receipt
    Receipt,
    /// A `TrialCompleted` event on the record's feed
    Event,
    /// A direct read of the record's progress
    Poll,
    /// Already confirmed before the submit call
    Prior,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The ledger refused the write
    Rejected(RejectReason),
    /// No confirmation inside the window. Inconclusive: a late confirmation
    /// still upgrades the attempt.
    Timeout { waited_ms: u64 },
    /// The gateway failed before the ledger answered
    Transport(String),
    /// The session ended while the attempt was pending
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Confirmed(ConfirmationSource),
    Failed(FailureReason),
}

impl AttemptStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    /// Pending, or timed out and still open to a late confirmation
    pub fn awaits_confirmation(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed(FailureReason::Timeout { .. }))
    }

    /// Next status after a confirmation, or `None` if it is a duplicate
    pub(crate) fn on_confirm(&self, source: ConfirmationSource) -> Option<AttemptStatus> {
        match self {
            Self::Pending | Self::Failed(FailureReason::Timeout { .. }) => {
                Some(Self::Confirmed(source))
            }
            _ => None,
        }
    }

    /// Next status after a failure; only a pending attempt can fail
    pub(crate) fn on_failure(&self, reason: FailureReason) -> Option<AttemptStatus> {
        match self {
            Self::Pending => Some(Self::Failed(reason)),
            _ => None,
        }
    }
}

/// Whether the handle belongs to a real write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    Submitted,
    /// The trial was already confirmed; nothing was written
    AlreadyConfirmed,
}

/// One write of one trial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAttempt {
    pub record_id: RecordId,
    pub trial: TrialKind,
    pub submitted_at: Timestamp,
    pub status: AttemptStatus,
}

/// Caller's view of a submitted attempt.
///
/// Cheap to clone; every clone observes the same attempt.
#[derive(Debug, Clone)]
pub struct AttemptHandle {
    record_id: RecordId,
    trial: TrialKind,
    submitted_at: Timestamp,
    origin: AttemptOrigin,
    rx: watch::Receiver<AttemptStatus>,
}

impl AttemptHandle {
    pub(crate) fn new(
        record_id: RecordId,
        trial: TrialKind,
        submitted_at: Timestamp,
        rx: watch::Receiver<AttemptStatus>,
    ) -> Self {
        Self {
            record_id,
            trial,
            submitted_at,
            origin: AttemptOrigin::Submitted,
            rx,
        }
    }

    /// Handle for a trial that is already confirmed
    pub(crate) fn already_confirmed(record_id: RecordId, trial: TrialKind, now: Timestamp) -> Self {
        let (_tx, rx) = watch::channel(AttemptStatus::Confirmed(ConfirmationSource::Prior));
        Self {
            record_id,
            trial,
            submitted_at: now,
            origin: AttemptOrigin::AlreadyConfirmed,
            rx,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn trial(&self) -> TrialKind {
        self.trial
    }

    pub fn origin(&self) -> AttemptOrigin {
        self.origin
    }

    pub fn status(&self) -> AttemptStatus {
        self.rx.borrow().clone()
    }

    pub fn attempt(&self) -> CompletionAttempt {
        CompletionAttempt {
            record_id: self.record_id,
            trial: self.trial,
            submitted_at: self.submitted_at,
            status: self.status(),
        }
    }

    /// Watch every status change, including a late upgrade after a timeout
    pub fn subscribe(&self) -> watch::Receiver<AttemptStatus> {
        self.rx.clone()
    }

    /// Wait until the attempt leaves `Pending`
    pub async fn wait(&self) -> AttemptStatus {
        let mut rx = self.rx.clone();
        let settled = rx.wait_for(|status| !status.is_pending()).await.map(|s| (*s).clone());
        match settled {
            Ok(status) => status,
            // Tracker dropped without settling
            Err(_) => self.status(),
        }
    }

    /// Wait for the terminal outcome and surface failures as errors
    pub async fn outcome(&self) -> Result<ConfirmationSource> {
        match self.wait().await {
            AttemptStatus::Confirmed(source) => Ok(source),
            AttemptStatus::Failed(reason) => Err(self.failure_error(reason)),
            AttemptStatus::Pending => Err(QuestError::Disconnected),
        }
    }

    fn failure_error(&self, reason: FailureReason) -> QuestError {
        match reason {
            FailureReason::Rejected(reason) => QuestError::Rejected(reason),
            FailureReason::Timeout { waited_ms } => QuestError::Timeout {
                trial: self.trial,
                waited_ms,
            },
            FailureReason::Transport(message) => QuestError::Transport(message),
            FailureReason::Abandoned => QuestError::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_confirmation_wins() {
        let confirmed = AttemptStatus::Pending.on_confirm(ConfirmationSource::Event).unwrap();
        assert_eq!(confirmed, AttemptStatus::Confirmed(ConfirmationSource::Event));
        assert!(confirmed.on_confirm(ConfirmationSource::Receipt).is_none());
        assert!(confirmed.on_failure(FailureReason::Transport("x".into())).is_none());
    }

    #[test]
    fn test_timeout_upgrades_on_late_confirmation() {
        let timed_out = AttemptStatus::Failed(FailureReason::Timeout { waited_ms: 10 });
        assert_eq!(
            timed_out.on_confirm(ConfirmationSource::Event),
            Some(AttemptStatus::Confirmed(ConfirmationSource::Event))
        );
    }

    #[test]
    fn test_rejection_is_final() {
        let rejected = AttemptStatus::Failed(FailureReason::Rejected(RejectReason::TimeLockActive));
        assert!(rejected.on_confirm(ConfirmationSource::Event).is_none());
    }

    #[tokio::test]
    async fn test_already_confirmed_handle() {
        let handle = AttemptHandle::already_confirmed(RecordId(1), TrialKind::Wisdom, 0);
        assert_eq!(handle.origin(), AttemptOrigin::AlreadyConfirmed);
        assert_eq!(handle.outcome().await.unwrap(), ConfirmationSource::Prior);
    }

    #[tokio::test]
    async fn test_outcome_maps_timeout() {
        let (tx, rx) = watch::channel(AttemptStatus::Pending);
        let handle = AttemptHandle::new(RecordId(1), TrialKind::Spirit, 0, rx);
        tx.send_replace(AttemptStatus::Failed(FailureReason::Timeout { waited_ms: 500 }));

        let err = handle.outcome().await.unwrap_err();
        assert_eq!(err, QuestError::Timeout { trial: TrialKind::Spirit, waited_ms: 500 });
    }
}
