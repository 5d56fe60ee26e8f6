//! Quest session client
//!
//! Ties the identity resolver, the progress store, the completion trackers
//! and the record's completion feed to one connected owner.

use crate::commitment::QuizAttempt;
use crate::config::QuestConfig;
use crate::error::{QuestError, Result};
use crate::identity::{IdentityResolver, RecordIdentity};
use crate::lock;
use crate::store::{Progress, ProgressStore, ProgressUpdate};
use crate::timelock::{TimeLockStatus, TimeLockWindow};
use crate::tracker::{AttemptHandle, CompletionTrackers, ConfirmationSource};
use crate::traits::{
    EventFilter, EventStream, LedgerCall, LedgerEvent, LedgerGateway, LedgerQuery,
    SessionSigner, TrialPayload,
};
use crate::types::{Address, RecordId, Timestamp, TrialFlags, TrialKind};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State owned by one connected owner
#[derive(Clone)]
struct Session {
    epoch: u64,
    owner: Address,
    signer: Arc<dyn SessionSigner>,
    trackers: Arc<CompletionTrackers>,
    /// Set once the completion feed for the bound record is running
    feed_bound: Arc<tokio::sync::Mutex<bool>>,
    /// Fetched once per session
    time_lock_secs: Arc<OnceCell<u64>>,
    created_at: Arc<OnceCell<Timestamp>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Session {
    fn shutdown(&self) {
        self.trackers.abandon_all();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

struct ClientInner {
    gateway: Arc<dyn LedgerGateway>,
    config: QuestConfig,
    store: Arc<ProgressStore>,
    resolver: IdentityResolver,
    session: Mutex<Option<Session>>,
}

impl ClientInner {
    fn session(&self) -> Result<Session> {
        lock(&self.session).clone().ok_or(QuestError::Disconnected)
    }

    /// Hand a task to the session for `epoch`, or abort it if that session is gone
    fn adopt(&self, epoch: u64, task: JoinHandle<()>) -> Result<()> {
        let current = lock(&self.session);
        match current.as_ref() {
            Some(session) if session.epoch == epoch => {
                lock(&session.tasks).push(task);
                Ok(())
            }
            _ => {
                task.abort();
                Err(QuestError::Disconnected)
            }
        }
    }

    async fn resolve_session(&self, session: &Session) -> Result<RecordIdentity> {
        let identity = self.resolver.resolve(&session.owner).await?;
        self.bind(session, identity.clone()).await?;
        Ok(identity)
    }

    /// Publish an identity and, once a record is bound, start its completion feed
    async fn bind(&self, session: &Session, identity: RecordIdentity) -> Result<()> {
        self.store
            .apply(session.epoch, ProgressUpdate::IdentityResolved(identity.clone()));
        let Some(record_id) = identity.record_id else {
            return Ok(());
        };

        let mut bound = session.feed_bound.lock().await;
        if *bound {
            return Ok(());
        }

        let events = self
            .gateway
            .subscribe(EventFilter::CompletionsOf(record_id))
            .await?;
        let router = spawn_feed_router(
            Arc::clone(&self.store),
            Arc::clone(&session.trackers),
            session.epoch,
            record_id,
            events,
        );
        self.adopt(session.epoch, router)?;
        *bound = true;

        info!(owner = %session.owner, record_id = %record_id, "Completion feed bound");
        // Guard stays held through the first poll
        self.poll(session, record_id).await?;
        Ok(())
    }

    /// Read the record's progress straight from the ledger
    async fn poll(&self, session: &Session, record_id: RecordId) -> Result<TrialFlags> {
        let query = LedgerQuery::Progress(record_id);
        let trials = self.gateway.read(&query).await?.into_progress(&query)?;
        self.store
            .apply(session.epoch, ProgressUpdate::Confirmed { record_id, trials });
        session
            .trackers
            .observe(record_id, trials, ConfirmationSource::Poll);
        debug!(record_id = %record_id, completed = trials.count(), "Progress polled");
        Ok(trials)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.shutdown();
        }
    }
}

/// Confirmed completions pushed by the ledger for one record
fn spawn_feed_router(
    store: Arc<ProgressStore>,
    trackers: Arc<CompletionTrackers>,
    epoch: u64,
    record_id: RecordId,
    mut events: EventStream,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let LedgerEvent::TrialCompleted {
                record_id: completed,
                trial,
                tx_hash,
            } = event
            else {
                continue;
            };
            if completed != record_id {
                continue;
            }

            debug!(record_id = %record_id, trial = %trial, tx_hash = %tx_hash, "Completion observed on feed");
            let trials = TrialFlags::new().with(trial);
            store.apply(epoch, ProgressUpdate::Confirmed { record_id, trials });
            trackers.observe(record_id, trials, ConfirmationSource::Event);
        }
        warn!(record_id = %record_id, "Completion feed closed");
    })
}

/// Binds records that show up after connect (a mint from this or another session)
fn spawn_identity_follower(inner: &Arc<ClientInner>, session: Session) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let mut rx = inner.resolver.watch();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let resolved = rx
                .borrow_and_update()
                .clone()
                .filter(|identity| identity.owner == session.owner && identity.is_resolved());
            let Some(identity) = resolved else {
                continue;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.bind(&session, identity).await {
                debug!(error = %e, "Late identity not bound");
            }
        }
    })
}

/// Quest progress client for one player session at a time.
///
/// Cheap to clone; clones share the session.
///
/// # Example
///
/// ```rust,ignore
/// use ronin_quest_sdk::{GatewaySigner, QuestClient, QuestConfig, TrialKind, TrialPayload};
///
/// let client = QuestClient::new(gateway.clone(), QuestConfig::default())?;
/// let signer = Arc::new(GatewaySigner::new(player, gateway));
///
/// let identity = client.connect(signer).await?;
/// if !identity.is_resolved() {
///     client.mint().await?;
/// }
///
/// let handle = client.submit(TrialPayload::Spirit { vow: "I walk the path".into() })?;
/// match handle.outcome().await {
///     Ok(_) => println!("{:?}", client.snapshot().completion()),
///     Err(e) => eprintln!("{}", e),
/// }
/// ```
#[derive(Clone)]
pub struct QuestClient {
    inner: Arc<ClientInner>,
}

impl QuestClient {
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: QuestConfig) -> Result<Self> {
        config.validate()?;
        let resolver = IdentityResolver::new(Arc::clone(&gateway), config.identity.clone());
        Ok(Self {
            inner: Arc::new(ClientInner {
                gateway,
                config,
                store: Arc::new(ProgressStore::new()),
                resolver,
                session: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &QuestConfig {
        &self.inner.config
    }

    /// Start a session for the signer's address and resolve its record.
    ///
    /// Any previous session is torn down first, and progress is cleared before
    /// the first await. An owner without a record gets an unresolved identity;
    /// a later mint is bound automatically.
    pub async fn connect(&self, signer: Arc<dyn SessionSigner>) -> Result<RecordIdentity> {
        let owner = signer.address().clone();
        self.teardown();

        let epoch = self.inner.store.reset(Some(owner.clone()));
        self.inner.resolver.reset();

        let trackers = CompletionTrackers::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&signer),
            epoch,
            &self.inner.config.tracker,
        );
        let session = Session {
            epoch,
            owner: owner.clone(),
            signer,
            trackers: Arc::new(trackers),
            feed_bound: Arc::new(tokio::sync::Mutex::new(false)),
            time_lock_secs: Arc::new(OnceCell::new()),
            created_at: Arc::new(OnceCell::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        *lock(&self.inner.session) = Some(session.clone());

        let follower = spawn_identity_follower(&self.inner, session.clone());
        self.inner.adopt(epoch, follower)?;

        info!(owner = %owner, epoch, "Session connected");
        self.inner.resolve_session(&session).await
    }

    /// End the session. Pending attempts are abandoned, not rolled back.
    pub fn disconnect(&self) {
        self.teardown();
        self.inner.resolver.reset();
        self.inner.store.reset(None);
        info!("Session disconnected");
    }

    fn teardown(&self) {
        let previous = lock(&self.inner.session).take();
        if let Some(session) = previous {
            debug!(owner = %session.owner, epoch = session.epoch, "Tearing down session");
            session.shutdown();
        }
    }

    /// Owner of the current session
    pub fn owner(&self) -> Option<Address> {
        lock(&self.inner.session).as_ref().map(|s| s.owner.clone())
    }

    pub fn identity(&self) -> Option<RecordIdentity> {
        self.inner.store.snapshot().identity().cloned()
    }

    pub fn snapshot(&self) -> Progress {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.inner.store.subscribe()
    }

    /// Run `listener` on every new snapshot
    pub fn subscribe_with<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: FnMut(&Progress) + Send + 'static,
    {
        self.inner.store.subscribe_with(listener)
    }

    /// Mint a record for the session owner. Returns the bound identity.
    pub async fn mint(&self) -> Result<RecordIdentity> {
        let session = self.inner.session()?;
        if let Some(identity) = self.identity().filter(|i| i.is_resolved()) {
            return Ok(identity);
        }

        info!(owner = %session.owner, "Minting quest record");
        session
            .signer
            .execute(&LedgerCall::Mint)
            .await?
            .into_result()?;
        self.inner.resolve_session(&session).await
    }

    /// Submit a trial completion for the bound record
    pub fn submit(&self, payload: TrialPayload) -> Result<AttemptHandle> {
        let session = self.inner.session()?;
        let record_id = self.snapshot().record_id().ok_or(QuestError::NotResolved)?;
        session.trackers.submit(record_id, payload)
    }

    /// Seal a finished quiz and submit it as the Wisdom trial
    pub fn submit_quiz(&self, attempt: QuizAttempt<'_>) -> Result<AttemptHandle> {
        let answers = attempt.seal()?;
        self.submit(TrialPayload::Wisdom { answers })
    }

    /// Latest attempt for a trial in this session
    pub fn attempt(&self, trial: TrialKind) -> Option<AttemptHandle> {
        let session = self.inner.session().ok()?;
        let record_id = self.snapshot().record_id()?;
        session.trackers.attempt(record_id, trial)
    }

    /// Re-read progress from the ledger, or retry resolution while unbound
    pub async fn refresh(&self) -> Result<Progress> {
        let session = self.inner.session()?;
        match self.snapshot().record_id() {
            Some(record_id) => {
                self.inner.poll(&session, record_id).await?;
            }
            None => {
                self.inner.resolve_session(&session).await?;
            }
        }
        Ok(self.snapshot())
    }

    /// Lock window of the bound record; `None` while unbound
    pub async fn time_lock_window(&self) -> Result<Option<TimeLockWindow>> {
        let session = self.inner.session()?;
        let Some(record_id) = self.snapshot().record_id() else {
            return Ok(None);
        };

        let gateway = &self.inner.gateway;
        let duration = *session
            .time_lock_secs
            .get_or_try_init(|| async {
                let query = LedgerQuery::TimeLockDuration;
                gateway.read(&query).await?.into_seconds(&query)
            })
            .await?;

        let minted = self
            .inner
            .resolver
            .last_mint()
            .filter(|mint| mint.record_id == record_id);
        let created_at = *session
            .created_at
            .get_or_try_init(|| async {
                if let Some(mint) = minted {
                    return Ok(mint.created_at);
                }
                let query = LedgerQuery::CreatedAt(record_id);
                gateway.read(&query).await?.into_timestamp(&query)
            })
            .await?;

        Ok(Some(TimeLockWindow::new(created_at, duration)))
    }

    /// Evaluate the Spirit trial gate at `now`. Fails closed while unbound.
    pub async fn time_lock(&self, now: Timestamp) -> Result<TimeLockStatus> {
        Ok(self
            .time_lock_window()
            .await?
            .map(|window| window.evaluate(now))
            .unwrap_or_else(TimeLockStatus::unknown))
    }
}
