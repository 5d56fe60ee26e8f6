//! Which quest record belongs to the connected owner
//!
//! Two strategies, equally authoritative:
//! 1. the `RecordMinted` event for the owner (no scanning), and
//! 2. a `balance_of` read followed, when positive, by a bounded `owner_of`
//!    scan over record ids `1..=max_scan_id`.
//!
//! The event is preferred: it is checked before the balance read, raced
//! against it, and re-checked between scan steps. If the owner has no record
//! yet, a standing subscription binds the record as soon as a mint lands.

use crate::config::IdentityConfig;
use crate::error::{QuestError, Result};
use crate::lock;
use crate::traits::{EventFilter, EventStream, LedgerEvent, LedgerGateway, LedgerQuery};
use crate::types::{Address, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Binding between an owner and their quest record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub owner: Address,
    /// Set once, never changes for this owner
    pub record_id: Option<RecordId>,
    /// An ownership signal (event or read) has been observed
    pub ownership_confirmed: bool,
}

impl RecordIdentity {
    pub fn unresolved(owner: Address) -> Self {
        Self {
            owner,
            record_id: None,
            ownership_confirmed: false,
        }
    }

    pub fn resolved(owner: Address, record_id: RecordId) -> Self {
        Self {
            owner,
            record_id: Some(record_id),
            ownership_confirmed: true,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.record_id.is_some()
    }
}

/// How a record id was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Event,
    Scan,
}

/// A mint seen on the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintSignal {
    pub record_id: RecordId,
    pub created_at: Timestamp,
}

fn as_mint(event: LedgerEvent, owner: &Address) -> Option<MintSignal> {
    match event {
        LedgerEvent::RecordMinted {
            owner: minted_for,
            record_id,
            created_at,
        } if &minted_for == owner => Some(MintSignal { record_id, created_at }),
        _ => None,
    }
}

/// Non-blocking: a mint already sitting in the stream (e.g. replayed history)
fn drain_mint(events: &mut EventStream, owner: &Address) -> Option<MintSignal> {
    while let Ok(event) = events.try_recv() {
        if let Some(mint) = as_mint(event, owner) {
            return Some(mint);
        }
    }
    None
}

/// Wait for the next mint; `None` once the stream closes
async fn next_mint(events: &mut EventStream, owner: &Address) -> Option<MintSignal> {
    while let Some(event) = events.recv().await {
        if let Some(mint) = as_mint(event, owner) {
            return Some(mint);
        }
    }
    None
}

/// Resolves and caches the record identity of one owner at a time
pub struct IdentityResolver {
    gateway: Arc<dyn LedgerGateway>,
    config: IdentityConfig,
    /// Serializes concurrent `resolve` calls
    resolving: tokio::sync::Mutex<()>,
    /// Bumped on every reset; in-flight resolutions from an older generation are discarded
    generation: AtomicU64,
    identity_tx: Arc<watch::Sender<Option<RecordIdentity>>>,
    last_mint: Arc<Mutex<Option<MintSignal>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl IdentityResolver {
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: IdentityConfig) -> Self {
        let (identity_tx, _) = watch::channel(None);
        Self {
            gateway,
            config,
            resolving: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            identity_tx: Arc::new(identity_tx),
            last_mint: Arc::new(Mutex::new(None)),
            watcher: Mutex::new(None),
        }
    }

    /// Cached identity, if any
    pub fn current(&self) -> Option<RecordIdentity> {
        self.identity_tx.borrow().clone()
    }

    /// Observe identity changes, including late mints found by the standing subscription
    pub fn watch(&self) -> watch::Receiver<Option<RecordIdentity>> {
        self.identity_tx.subscribe()
    }

    /// Mint details seen on the feed for the current owner, if any
    pub fn last_mint(&self) -> Option<MintSignal> {
        *lock(&self.last_mint)
    }

    /// Forget the current owner and tear down the standing subscription
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        *lock(&self.last_mint) = None;
        self.identity_tx.send_replace(None);
        debug!("Identity resolver reset");
    }

    /// Resolve the record identity for `owner`.
    ///
    /// Idempotent once a record is bound. An owner with a zero balance resolves
    /// to an identity without a record (not an error); a positive balance with
    /// no match inside the scan bound fails with `IdentityUnresolved`.
    pub async fn resolve(&self, owner: &Address) -> Result<RecordIdentity> {
        let _guard = self.resolving.lock().await;

        if let Some(current) = self.current() {
            if &current.owner == owner && current.is_resolved() {
                return Ok(current);
            }
            if &current.owner != owner {
                self.reset();
            }
        }
        let generation = self.generation.load(Ordering::SeqCst);

        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }

        let mut events = self
            .gateway
            .subscribe(EventFilter::MintedBy(owner.clone()))
            .await?;

        let outcome = self.resolve_with(owner, &mut events).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(owner = %owner, "Resolution outlived its session");
            return Err(QuestError::Disconnected);
        }

        if let Ok(identity) = &outcome {
            self.identity_tx.send_replace(Some(identity.clone()));
        }

        // Published first so a mint racing this point is not overwritten
        let keep_watching = match &outcome {
            Ok(identity) => !identity.is_resolved(),
            Err(QuestError::IdentityUnresolved { .. }) => true,
            Err(_) => false,
        };
        if keep_watching {
            let handle = self.spawn_watcher(owner.clone(), events);
            *lock(&self.watcher) = Some(handle);
        }

        outcome
    }

    async fn resolve_with(
        &self,
        owner: &Address,
        events: &mut EventStream,
    ) -> Result<RecordIdentity> {
        if let Some(mint) = drain_mint(events, owner) {
            return Ok(self.bind(owner, mint, ResolutionSource::Event));
        }

        let query = LedgerQuery::BalanceOf(owner.clone());
        let balance = tokio::select! {
            biased;
            Some(mint) = next_mint(events, owner) => {
                return Ok(self.bind(owner, mint, ResolutionSource::Event));
            }
            read = self.gateway.read(&query) => read?.into_count(&query)?,
        };

        if balance == 0 {
            debug!(owner = %owner, "Owner holds no record yet");
            return Ok(RecordIdentity::unresolved(owner.clone()));
        }

        for candidate in 1..=self.config.max_scan_id {
            if let Some(mint) = drain_mint(events, owner) {
                return Ok(self.bind(owner, mint, ResolutionSource::Event));
            }

            let record_id = RecordId(candidate);
            let query = LedgerQuery::OwnerOf(record_id);
            let holder = self.gateway.read(&query).await?.into_owner(&query)?;
            if holder.as_ref() == Some(owner) {
                info!(owner = %owner, record_id = %record_id, source = ?ResolutionSource::Scan, "Record identity resolved");
                return Ok(RecordIdentity::resolved(owner.clone(), record_id));
            }
        }

        warn!(owner = %owner, balance, scanned = self.config.max_scan_id, "Ownership scan exhausted");
        Err(QuestError::IdentityUnresolved {
            owner: owner.clone(),
            scanned: self.config.max_scan_id,
        })
    }

    fn bind(&self, owner: &Address, mint: MintSignal, source: ResolutionSource) -> RecordIdentity {
        *lock(&self.last_mint) = Some(mint);
        info!(owner = %owner, record_id = %mint.record_id, source = ?source, "Record identity resolved");
        RecordIdentity::resolved(owner.clone(), mint.record_id)
    }

    fn spawn_watcher(&self, owner: Address, mut events: EventStream) -> JoinHandle<()> {
        let identity_tx = Arc::clone(&self.identity_tx);
        let last_mint = Arc::clone(&self.last_mint);
        tokio::spawn(async move {
            let Some(mint) = next_mint(&mut events, &owner).await else {
                debug!(owner = %owner, "Mint subscription closed");
                return;
            };
            *lock(&last_mint) = Some(mint);
            let bound = identity_tx.send_if_modified(|current| {
                let unbound = match current {
                    Some(identity) => identity.owner == owner && !identity.is_resolved(),
                    None => true,
                };
                if unbound {
                    *current = Some(RecordIdentity::resolved(owner.clone(), mint.record_id));
                }
                unbound
            });
            if bound {
                info!(owner = %owner, record_id = %mint.record_id, "Late mint bound to session");
            }
        })
    }
}

impl Drop for IdentityResolver {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::traits::LedgerCall;

    fn config() -> IdentityConfig {
        IdentityConfig { max_scan_id: 8 }
    }

    #[tokio::test]
    async fn test_zero_balance_resolves_without_record() {
        let ledger = Arc::new(InMemoryLedger::new());
        let resolver = IdentityResolver::new(ledger.clone(), config());
        let owner = Address::new("0xa11ce");

        let identity = resolver.resolve(&owner).await.unwrap();
        assert_eq!(identity, RecordIdentity::unresolved(owner));
        assert_eq!(ledger.reads_of(|q| matches!(q, LedgerQuery::OwnerOf(_))), 0);
    }

    #[tokio::test]
    async fn test_replayed_mint_skips_scan() {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Address::new("0xa11ce");
        ledger.write(&owner, &LedgerCall::Mint).await.unwrap();

        let resolver = IdentityResolver::new(ledger.clone(), config());
        let identity = resolver.resolve(&owner).await.unwrap();

        assert_eq!(identity.record_id, Some(RecordId(1)));
        assert_eq!(ledger.reads_of(|q| matches!(q, LedgerQuery::BalanceOf(_))), 0);
        assert_eq!(ledger.reads_of(|q| matches!(q, LedgerQuery::OwnerOf(_))), 0);
        assert!(resolver.last_mint().is_some());
    }

    #[tokio::test]
    async fn test_scan_finds_record_when_history_missing() {
        let ledger = Arc::new(InMemoryLedger::new());
        let other = Address::new("0xb0b");
        let owner = Address::new("0xa11ce");
        ledger.write(&other, &LedgerCall::Mint).await.unwrap();
        ledger.write(&owner, &LedgerCall::Mint).await.unwrap();
        ledger.set_replay_history(false);

        let resolver = IdentityResolver::new(ledger.clone(), config());
        let identity = resolver.resolve(&owner).await.unwrap();

        assert_eq!(identity.record_id, Some(RecordId(2)));
        assert!(identity.ownership_confirmed);
        assert_eq!(ledger.reads_of(|q| matches!(q, LedgerQuery::OwnerOf(_))), 2);
    }

    #[tokio::test]
    async fn test_scan_is_bounded() {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Address::new("0xa11ce");
        for i in 0..10 {
            ledger.write(&Address::new(format!("0x{}", i)), &LedgerCall::Mint).await.unwrap();
        }
        ledger.write(&owner, &LedgerCall::Mint).await.unwrap();
        ledger.set_replay_history(false);

        let resolver = IdentityResolver::new(ledger.clone(), config());
        let err = resolver.resolve(&owner).await.unwrap_err();

        assert!(matches!(err, QuestError::IdentityUnresolved { scanned: 8, .. }));
        assert_eq!(ledger.reads_of(|q| matches!(q, LedgerQuery::OwnerOf(_))), 8);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Address::new("0xa11ce");
        ledger.write(&owner, &LedgerCall::Mint).await.unwrap();

        let resolver = IdentityResolver::new(ledger.clone(), config());
        let first = resolver.resolve(&owner).await.unwrap();
        let subscriptions = ledger.subscription_count();
        let second = resolver.resolve(&owner).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.subscription_count(), subscriptions);
    }

    #[tokio::test]
    async fn test_standing_subscription_binds_late_mint() {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = Address::new("0xa11ce");
        let resolver = IdentityResolver::new(ledger.clone(), config());
        let mut rx = resolver.watch();

        assert!(!resolver.resolve(&owner).await.unwrap().is_resolved());
        rx.borrow_and_update();

        ledger.write(&owner, &LedgerCall::Mint).await.unwrap();
        rx.changed().await.unwrap();

        let identity = rx.borrow().clone().unwrap();
        assert_eq!(identity.record_id, Some(RecordId(1)));
        assert_eq!(resolver.current(), Some(identity));
    }

    #[tokio::test]
    async fn test_owner_switch_resets() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = Address::new("0xa11ce");
        let bob = Address::new("0xb0b");
        ledger.write(&alice, &LedgerCall::Mint).await.unwrap();

        let resolver = IdentityResolver::new(ledger.clone(), config());
        assert!(resolver.resolve(&alice).await.unwrap().is_resolved());

        let identity = resolver.resolve(&bob).await.unwrap();
        assert_eq!(identity, RecordIdentity::unresolved(bob));
    }
}
