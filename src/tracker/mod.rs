//! Trial completion writes: submit, then pending, then confirmed or failed
//!
//! Each submitted write gets a `CompletionTracker`. Its status is driven by
//! two independent confirmation channels (the write's receipt and the record's
//! event feed, plus direct polls) and a timeout. Every transition goes
//! through one guarded step, so the first confirmation wins and later ones are
//! ignored.
//!
//! `CompletionTrackers` holds the attempts of one session in a table keyed by
//! `(RecordId, TrialKind)` and enforces a single live write per key. Timed-out
//! attempts stay in the table after a retry so a late confirmation still
//! reaches them.

mod attempt;

pub use attempt::{
    AttemptHandle, AttemptOrigin, AttemptStatus, CompletionAttempt, ConfirmationSource,
    FailureReason,
};

use crate::config::TrackerConfig;
use crate::error::{GatewayError, QuestError, Result};
use crate::lock;
use crate::store::{ProgressStore, ProgressUpdate};
use crate::traits::{LedgerCall, Receipt, SessionSigner, TrialPayload};
use crate::types::{unix_now, RecordId, Timestamp, TrialFlags, TrialKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State machine for one write of one trial
pub struct CompletionTracker {
    record_id: RecordId,
    trial: TrialKind,
    epoch: u64,
    submitted_at: Timestamp,
    timeout_ms: u64,
    status: watch::Sender<AttemptStatus>,
    store: Arc<ProgressStore>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionTracker {
    fn new(
        store: Arc<ProgressStore>,
        epoch: u64,
        record_id: RecordId,
        trial: TrialKind,
        timeout_ms: u64,
    ) -> Self {
        let (status, _) = watch::channel(AttemptStatus::Pending);
        Self {
            record_id,
            trial,
            epoch,
            submitted_at: unix_now(),
            timeout_ms,
            status,
            store,
            dispatch: Mutex::new(None),
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn trial(&self) -> TrialKind {
        self.trial
    }

    pub fn status(&self) -> AttemptStatus {
        self.status.borrow().clone()
    }

    /// A non-terminal attempt blocks further submits for the same trial
    pub fn is_live(&self) -> bool {
        self.status.borrow().is_pending()
    }

    /// Pending or timed out: a confirmation can still move this attempt
    fn awaits_confirmation(&self) -> bool {
        self.status.borrow().awaits_confirmation()
    }

    pub fn handle(&self) -> AttemptHandle {
        AttemptHandle::new(self.record_id, self.trial, self.submitted_at, self.status.subscribe())
    }

    /// Apply the optimistic overlay and dispatch the write
    fn launch(self: &Arc<Self>, signer: Arc<dyn SessionSigner>, call: LedgerCall) {
        self.store.apply(
            self.epoch,
            ProgressUpdate::Optimistic {
                record_id: self.record_id,
                trial: self.trial,
            },
        );

        let tracker = Arc::clone(self);
        let timeout = Duration::from_millis(self.timeout_ms);
        let handle = tokio::spawn(async move {
            let mut settled = tracker.status.subscribe();
            let outcome = tokio::select! {
                result = signer.execute(&call) => Some(result.and_then(Receipt::into_result)),
                _ = tokio::time::sleep(timeout) => None,
                // Confirmed by another channel; the receipt no longer matters
                _ = async { settled.wait_for(|s| !s.is_pending()).await.is_ok() } => return,
            };

            match outcome {
                Some(Ok(receipt)) => {
                    debug!(trial = %tracker.trial, tx_hash = %receipt.tx_hash, "Receipt accepted");
                    tracker.confirm(ConfirmationSource::Receipt);
                }
                Some(Err(GatewayError::Rejected(reason))) => {
                    tracker.fail(FailureReason::Rejected(reason));
                }
                Some(Err(GatewayError::Transport(message))) => {
                    tracker.fail(FailureReason::Transport(message));
                }
                None => {
                    tracker.fail(FailureReason::Timeout { waited_ms: tracker.timeout_ms });
                }
            }
        });
        *lock(&self.dispatch) = Some(handle);
    }

    /// Record a confirmation. Returns `false` for a duplicate.
    pub fn confirm(&self, source: ConfirmationSource) -> bool {
        let moved = self.status.send_if_modified(|status| match status.on_confirm(source) {
            Some(next) => {
                *status = next;
                true
            }
            None => false,
        });
        if moved {
            info!(record_id = %self.record_id, trial = %self.trial, source = ?source, "Trial confirmed");
            self.store.apply(
                self.epoch,
                ProgressUpdate::Settled {
                    record_id: self.record_id,
                    trial: self.trial,
                },
            );
        } else {
            debug!(trial = %self.trial, source = ?source, "Duplicate confirmation ignored");
        }
        moved
    }

    /// Fail a pending attempt and roll back its optimistic overlay
    pub fn fail(&self, reason: FailureReason) -> bool {
        let rollback = reason != FailureReason::Abandoned;
        let moved = self.status.send_if_modified(|status| match status.on_failure(reason.clone()) {
            Some(next) => {
                *status = next;
                true
            }
            None => false,
        });
        if !moved {
            return false;
        }

        warn!(record_id = %self.record_id, trial = %self.trial, reason = ?reason, "Attempt failed");
        if rollback {
            self.store.apply(
                self.epoch,
                ProgressUpdate::RolledBack {
                    record_id: self.record_id,
                    trial: self.trial,
                },
            );
        }
        true
    }

    /// Abandon the attempt without touching the overlay; the write may still land
    pub fn cancel(&self) {
        if let Some(dispatch) = lock(&self.dispatch).take() {
            dispatch.abort();
        }
        self.fail(FailureReason::Abandoned);
    }
}

/// Attempts of one session, keyed by `(RecordId, TrialKind)`, oldest first
pub struct CompletionTrackers {
    store: Arc<ProgressStore>,
    signer: Arc<dyn SessionSigner>,
    epoch: u64,
    timeout_ms: u64,
    attempts: Mutex<HashMap<(RecordId, TrialKind), Vec<Arc<CompletionTracker>>>>,
}

impl CompletionTrackers {
    pub fn new(
        store: Arc<ProgressStore>,
        signer: Arc<dyn SessionSigner>,
        epoch: u64,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            store,
            signer,
            epoch,
            timeout_ms: config.confirmation_timeout_ms,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a completion for `record_id`.
    ///
    /// Fails with `AlreadyPending` while a live attempt exists for the trial.
    /// A trial that is already confirmed returns a `Confirmed` handle and
    /// writes nothing.
    pub fn submit(&self, record_id: RecordId, payload: TrialPayload) -> Result<AttemptHandle> {
        payload.validate()?;
        let trial = payload.trial();
        let key = (record_id, trial);

        let tracker = {
            let mut attempts = lock(&self.attempts);
            if attempts.get(&key).is_some_and(|ts| ts.iter().any(|t| t.is_live())) {
                debug!(record_id = %record_id, trial = %trial, "Submit refused, attempt pending");
                return Err(QuestError::AlreadyPending { trial });
            }

            let snapshot = self.store.snapshot();
            if snapshot.epoch() != self.epoch {
                return Err(QuestError::Disconnected);
            }
            if snapshot.record_id() != Some(record_id) {
                return Err(QuestError::NotResolved);
            }
            if snapshot.is_confirmed(trial) {
                debug!(record_id = %record_id, trial = %trial, "Trial already confirmed, nothing to write");
                return Ok(AttemptHandle::already_confirmed(record_id, trial, unix_now()));
            }

            let tracker = Arc::new(CompletionTracker::new(
                Arc::clone(&self.store),
                self.epoch,
                record_id,
                trial,
                self.timeout_ms,
            ));
            let slot = attempts.entry(key).or_default();
            slot.retain(|t| t.awaits_confirmation());
            slot.push(Arc::clone(&tracker));
            tracker
        };

        info!(record_id = %record_id, trial = %trial, "Submitting trial completion");
        tracker.launch(
            Arc::clone(&self.signer),
            LedgerCall::CompleteTrial { record_id, payload },
        );
        Ok(tracker.handle())
    }

    /// Handle of the latest attempt for a trial
    pub fn attempt(&self, record_id: RecordId, trial: TrialKind) -> Option<AttemptHandle> {
        lock(&self.attempts)
            .get(&(record_id, trial))
            .and_then(|ts| ts.last())
            .map(|t| t.handle())
    }

    /// Route confirmations observed outside the write path
    pub fn observe(&self, record_id: RecordId, trials: TrialFlags, source: ConfirmationSource) {
        let trackers: Vec<_> = {
            let attempts = lock(&self.attempts);
            trials
                .iter_set()
                .filter_map(|trial| attempts.get(&(record_id, trial)))
                .flatten()
                .cloned()
                .collect()
        };
        for tracker in trackers {
            tracker.confirm(source);
        }
    }

    /// Abandon every pending attempt (session ended)
    pub fn abandon_all(&self) {
        let trackers: Vec<_> = lock(&self.attempts).drain().flat_map(|(_, ts)| ts).collect();
        for tracker in trackers {
            tracker.cancel();
        }
    }
}
