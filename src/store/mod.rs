//! Aggregate progress view
//!
//! `ProgressStore` owns the one authoritative `Progress` value. Every source
//! (identity resolution, trackers, the event feed, direct polls) goes through
//! `apply`, which runs the reducer inside the watch channel's write lock and
//! publishes the result as a single value swap. Subscribers therefore only
//! ever see whole snapshots.
//!
//! Merge rule per trial: `complete = confirmed || optimistic`. `confirmed` is
//! sticky for the lifetime of a session epoch; `optimistic` is cleared on
//! rollback. A reset opens a new epoch, and updates stamped with an older
//! epoch are dropped.

use crate::identity::RecordIdentity;
use crate::types::{Address, RecordId, TrialFlags, TrialKind};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Per-trial display state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// No record bound; nothing can be attempted
    Locked,
    Available,
    /// A write is in flight
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrialSlot {
    /// Seen on the ledger (receipt, event or poll)
    pub confirmed: bool,
    /// Locally submitted, not yet confirmed
    pub optimistic: bool,
    /// A live attempt exists
    pub pending: bool,
}

/// Immutable snapshot of the player's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    epoch: u64,
    identity: Option<RecordIdentity>,
    slots: [TrialSlot; 3],
}

impl Progress {
    fn empty(epoch: u64, owner: Option<Address>) -> Self {
        Self {
            epoch,
            identity: owner.map(RecordIdentity::unresolved),
            slots: [TrialSlot::default(); 3],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn identity(&self) -> Option<&RecordIdentity> {
        self.identity.as_ref()
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.identity.as_ref().and_then(|i| i.record_id)
    }

    pub fn slot(&self, trial: TrialKind) -> TrialSlot {
        self.slots[trial.index()]
    }

    pub fn is_complete(&self, trial: TrialKind) -> bool {
        let slot = self.slot(trial);
        slot.confirmed || slot.optimistic
    }

    pub fn is_confirmed(&self, trial: TrialKind) -> bool {
        self.slot(trial).confirmed
    }

    pub fn completion(&self) -> BTreeMap<TrialKind, bool> {
        TrialKind::ALL
            .into_iter()
            .map(|t| (t, self.is_complete(t)))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        TrialKind::ALL.into_iter().filter(|t| self.is_complete(*t)).count()
    }

    pub fn status(&self, trial: TrialKind) -> TrialStatus {
        let slot = self.slot(trial);
        if slot.confirmed {
            TrialStatus::Completed
        } else if slot.pending {
            TrialStatus::Pending
        } else if slot.optimistic {
            TrialStatus::Completed
        } else if self.record_id().is_none() {
            TrialStatus::Locked
        } else {
            TrialStatus::Available
        }
    }
}

/// Inputs to the reducer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Identity resolution finished (with or without a record)
    IdentityResolved(RecordIdentity),
    /// Trials seen as complete on the ledger
    Confirmed { record_id: RecordId, trials: TrialFlags },
    /// A write was submitted for `trial`
    Optimistic { record_id: RecordId, trial: TrialKind },
    /// The live attempt for `trial` confirmed
    Settled { record_id: RecordId, trial: TrialKind },
    /// The live attempt for `trial` failed or was abandoned
    RolledBack { record_id: RecordId, trial: TrialKind },
}

impl ProgressUpdate {
    fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::IdentityResolved(identity) => identity.record_id,
            Self::Confirmed { record_id, .. }
            | Self::Optimistic { record_id, .. }
            | Self::Settled { record_id, .. }
            | Self::RolledBack { record_id, .. } => Some(*record_id),
        }
    }
}

/// Serialized owner of the aggregate progress state.
///
/// # Example
///
/// ```rust,ignore
/// let store = ProgressStore::new();
/// let epoch = store.reset(Some(owner.clone()));
/// store.apply(epoch, ProgressUpdate::IdentityResolved(identity));
///
/// let mut rx = store.subscribe();
/// while rx.changed().await.is_ok() {
///     render(&rx.borrow());
/// }
/// ```
#[derive(Debug)]
pub struct ProgressStore {
    tx: watch::Sender<Progress>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Progress::empty(0, None));
        Self { tx }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Progress {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    /// Run `listener` on each new snapshot until the store is dropped
    pub fn subscribe_with<F>(&self, mut listener: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(&Progress) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                listener(&snapshot);
            }
        })
    }

    /// Drop all progress and open a new epoch for `owner`.
    ///
    /// Synchronous: once this returns, no snapshot from the previous owner is
    /// observable and stale updates are rejected by epoch.
    pub fn reset(&self, owner: Option<Address>) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|progress| {
            epoch = progress.epoch + 1;
            *progress = Progress::empty(epoch, owner.clone());
        });
        info!(epoch, owner = ?owner, "Progress reset");
        epoch
    }

    /// Apply one update atomically. Returns whether the snapshot changed.
    pub fn apply(&self, epoch: u64, update: ProgressUpdate) -> bool {
        self.tx.send_if_modified(|progress| reduce(progress, epoch, &update))
    }
}

fn reduce(progress: &mut Progress, epoch: u64, update: &ProgressUpdate) -> bool {
    if epoch != progress.epoch {
        debug!(stale = epoch, current = progress.epoch, "Dropping update from old epoch");
        return false;
    }

    if let ProgressUpdate::IdentityResolved(resolved) = update {
        return resolve_identity(progress, resolved);
    }

    // Everything else must target the bound record
    if progress.record_id() != update.record_id() {
        debug!(
            bound = ?progress.record_id(),
            update = ?update.record_id(),
            "Dropping update for unbound record"
        );
        return false;
    }

    let before = progress.slots;
    match update {
        ProgressUpdate::IdentityResolved(_) => {}
        ProgressUpdate::Confirmed { trials, .. } => {
            for trial in trials.iter_set() {
                progress.slots[trial.index()].confirmed = true;
            }
        }
        ProgressUpdate::Optimistic { trial, .. } => {
            let slot = &mut progress.slots[trial.index()];
            slot.optimistic = true;
            slot.pending = true;
        }
        ProgressUpdate::Settled { trial, .. } => {
            let slot = &mut progress.slots[trial.index()];
            slot.confirmed = true;
            slot.optimistic = false;
            slot.pending = false;
        }
        ProgressUpdate::RolledBack { trial, .. } => {
            let slot = &mut progress.slots[trial.index()];
            slot.optimistic = false;
            slot.pending = false;
        }
    }
    progress.slots != before
}

fn resolve_identity(progress: &mut Progress, resolved: &RecordIdentity) -> bool {
    match &progress.identity {
        Some(current) if current.owner != resolved.owner => {
            warn!(current = %current.owner, resolved = %resolved.owner, "Identity for another owner ignored");
            false
        }
        Some(current) if current.record_id.is_some() && current.record_id != resolved.record_id => {
            // Record ids never change for an owner once minted
            warn!(current = ?current.record_id, resolved = ?resolved.record_id, "Conflicting record id ignored");
            false
        }
        Some(current) if current == resolved => false,
        _ => {
            progress.identity = Some(resolved.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Address {
        Address::new("0xa11ce")
    }

    fn bound_store() -> (ProgressStore, u64) {
        let store = ProgressStore::new();
        let epoch = store.reset(Some(owner()));
        store.apply(epoch, ProgressUpdate::IdentityResolved(RecordIdentity::resolved(owner(), RecordId(1))));
        (store, epoch)
    }

    #[test]
    fn test_confirmed_is_sticky() {
        let (store, epoch) = bound_store();
        let record_id = RecordId(1);
        store.apply(epoch, ProgressUpdate::Confirmed {
            record_id,
            trials: TrialFlags::new().with(TrialKind::Wisdom),
        });
        assert!(store.snapshot().is_complete(TrialKind::Wisdom));

        // A later rollback or an all-false poll must not clear it
        store.apply(epoch, ProgressUpdate::RolledBack { record_id, trial: TrialKind::Wisdom });
        store.apply(epoch, ProgressUpdate::Confirmed { record_id, trials: TrialFlags::new() });
        assert!(store.snapshot().is_complete(TrialKind::Wisdom));
        assert_eq!(store.snapshot().status(TrialKind::Wisdom), TrialStatus::Completed);
    }

    #[test]
    fn test_optimistic_then_rollback() {
        let (store, epoch) = bound_store();
        let record_id = RecordId(1);
        store.apply(epoch, ProgressUpdate::Optimistic { record_id, trial: TrialKind::Spirit });
        let snap = store.snapshot();
        assert!(snap.is_complete(TrialKind::Spirit));
        assert!(!snap.is_confirmed(TrialKind::Spirit));
        assert_eq!(snap.status(TrialKind::Spirit), TrialStatus::Pending);

        store.apply(epoch, ProgressUpdate::RolledBack { record_id, trial: TrialKind::Spirit });
        assert!(!store.snapshot().is_complete(TrialKind::Spirit));
        assert_eq!(store.snapshot().status(TrialKind::Spirit), TrialStatus::Available);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (store, epoch) = bound_store();
        store.apply(epoch, ProgressUpdate::Confirmed {
            record_id: RecordId(1),
            trials: TrialFlags::new().with(TrialKind::Technique).with(TrialKind::Spirit),
        });

        let next = store.reset(Some(Address::new("0xb0b")));
        let snap = store.snapshot();
        assert_eq!(snap.completed_count(), 0);
        assert_eq!(snap.record_id(), None);
        assert_eq!(snap.status(TrialKind::Technique), TrialStatus::Locked);
        assert!(next > epoch);
    }

    #[test]
    fn test_stale_epoch_dropped() {
        let (store, old_epoch) = bound_store();
        let epoch = store.reset(Some(owner()));
        store.apply(epoch, ProgressUpdate::IdentityResolved(RecordIdentity::resolved(owner(), RecordId(1))));

        let changed = store.apply(old_epoch, ProgressUpdate::Confirmed {
            record_id: RecordId(1),
            trials: TrialFlags::new().with(TrialKind::Technique),
        });
        assert!(!changed);
        assert!(!store.snapshot().is_complete(TrialKind::Technique));
    }

    #[test]
    fn test_record_id_is_immutable() {
        let (store, epoch) = bound_store();
        let changed = store.apply(
            epoch,
            ProgressUpdate::IdentityResolved(RecordIdentity::resolved(owner(), RecordId(2))),
        );
        assert!(!changed);
        assert_eq!(store.snapshot().record_id(), Some(RecordId(1)));
    }

    #[test]
    fn test_update_for_other_record_dropped() {
        let (store, epoch) = bound_store();
        assert!(!store.apply(epoch, ProgressUpdate::Optimistic {
            record_id: RecordId(9),
            trial: TrialKind::Wisdom,
        }));
    }

    #[tokio::test]
    async fn test_subscribers_see_whole_batches() {
        let (store, epoch) = bound_store();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.apply(epoch, ProgressUpdate::Confirmed {
            record_id: RecordId(1),
            trials: TrialFlags::new().with(TrialKind::Technique).with(TrialKind::Wisdom),
        });

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert!(seen.is_complete(TrialKind::Technique));
        assert!(seen.is_complete(TrialKind::Wisdom));
    }
}
