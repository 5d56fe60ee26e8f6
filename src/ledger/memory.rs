//! In-process ledger

use crate::commitment::{AnswerKey, SealedAnswers};
use crate::error::{GatewayError, RejectReason};
use crate::lock;
use crate::traits::{
    EventFilter, EventStream, LedgerCall, LedgerEvent, LedgerGateway, LedgerQuery, LedgerValue,
    Receipt, ReceiptStatus, TrialPayload,
};
use crate::types::{unix_now, Address, RecordId, Timestamp, TrialFlags};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default Spirit trial lock: one day
const DEFAULT_TIME_LOCK_SECS: u64 = 24 * 60 * 60;
/// Events buffered per subscription
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Faults the ledger injects into reads, writes and the event feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerFaults {
    /// Replay matching history to each new subscriber
    pub replay_history: bool,
    /// Queue events instead of delivering them, until `release_events`
    pub hold_events: bool,
    /// Apply writes but never return their receipts
    pub lose_receipts: bool,
    pub receipt_delay: Option<Duration>,
    pub read_delay: Option<Duration>,
    /// Report rule violations as reverted receipts instead of refusing the call
    pub revert_in_receipt: bool,
    /// Every call fails with a transport error without touching state
    pub transport_down: bool,
}

impl Default for LedgerFaults {
    fn default() -> Self {
        Self {
            replay_history: true,
            hold_events: false,
            lose_receipts: false,
            receipt_delay: None,
            read_delay: None,
            revert_in_receipt: false,
            transport_down: false,
        }
    }
}

#[derive(Debug, Clone)]
struct RecordState {
    owner: Address,
    created_at: Timestamp,
    completed: TrialFlags,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<LedgerEvent>,
}

struct LedgerState {
    now: Timestamp,
    time_lock_secs: u64,
    records: BTreeMap<RecordId, RecordState>,
    next_record: u64,
    next_tx: u64,
    answer_key: AnswerKey,
    /// Matching commitments needed to pass; `None` means every key entry
    wisdom_threshold: Option<usize>,
    collections: HashSet<Address>,
    holdings: HashSet<(Address, Address)>,
    history: Vec<LedgerEvent>,
    held: Vec<LedgerEvent>,
    subscribers: Vec<Subscriber>,
    faults: LedgerFaults,
    reads: Vec<LedgerQuery>,
    writes: usize,
    subscriptions: usize,
}

impl LedgerState {
    fn tx_hash(&mut self) -> String {
        self.next_tx += 1;
        format!("0x{:064x}", self.next_tx)
    }

    fn owned_by(&self, owner: &Address) -> impl Iterator<Item = (&RecordId, &RecordState)> + '_ {
        let owner = owner.clone();
        self.records.iter().filter(move |(_, r)| r.owner == owner)
    }

    fn apply(
        &mut self,
        caller: &Address,
        call: &LedgerCall,
    ) -> Result<(Receipt, Vec<LedgerEvent>), RejectReason> {
        match call {
            LedgerCall::Mint => {
                if self.owned_by(caller).next().is_some() {
                    return Err(RejectReason::Other("pact already minted".into()));
                }
                self.next_record += 1;
                let record_id = RecordId(self.next_record);
                self.records.insert(
                    record_id,
                    RecordState {
                        owner: caller.clone(),
                        created_at: self.now,
                        completed: TrialFlags::new(),
                    },
                );
                let event = LedgerEvent::RecordMinted {
                    owner: caller.clone(),
                    record_id,
                    created_at: self.now,
                };
                Ok((Receipt::accepted(self.tx_hash()), vec![event]))
            }
            LedgerCall::CompleteTrial { record_id, payload } => {
                let record = self.records.get(record_id).ok_or(RejectReason::UnknownRecord)?;
                if &record.owner != caller {
                    return Err(RejectReason::NotOwner);
                }
                let trial = payload.trial();
                if record.completed.get(trial) {
                    return Err(RejectReason::AlreadyCompleted);
                }
                self.check_payload(caller, record.created_at, payload)?;

                if let Some(record) = self.records.get_mut(record_id) {
                    record.completed.set(trial, true);
                }
                let tx_hash = self.tx_hash();
                let event = LedgerEvent::TrialCompleted {
                    record_id: *record_id,
                    trial,
                    tx_hash: tx_hash.clone(),
                };
                Ok((Receipt::accepted(tx_hash), vec![event]))
            }
        }
    }

    fn check_payload(
        &self,
        caller: &Address,
        created_at: Timestamp,
        payload: &TrialPayload,
    ) -> Result<(), RejectReason> {
        match payload {
            TrialPayload::Technique { collection } => {
                if !self.collections.contains(collection) {
                    return Err(RejectReason::Other("collection not allowlisted".into()));
                }
                if !self.holdings.contains(&(caller.clone(), collection.clone())) {
                    return Err(RejectReason::Other("no token held in collection".into()));
                }
                Ok(())
            }
            TrialPayload::Wisdom { answers } => self.check_answers(answers),
            TrialPayload::Spirit { vow } => {
                if vow.trim().is_empty() {
                    return Err(RejectReason::Other("vow is empty".into()));
                }
                if self.now.saturating_sub(created_at) < self.time_lock_secs {
                    return Err(RejectReason::TimeLockActive);
                }
                Ok(())
            }
        }
    }

    fn check_answers(&self, answers: &SealedAnswers) -> Result<(), RejectReason> {
        let needed = self.wisdom_threshold.unwrap_or(self.answer_key.len());
        if self.answer_key.is_empty() || self.answer_key.score(answers) < needed {
            return Err(RejectReason::IncorrectAnswers);
        }
        Ok(())
    }

    fn publish(&mut self, events: Vec<LedgerEvent>) {
        for event in events {
            self.history.push(event.clone());
            if self.faults.hold_events {
                self.held.push(event);
            } else {
                self.deliver(event);
            }
        }
    }

    fn deliver(&mut self, event: LedgerEvent) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &self.subscribers {
            if sub.filter.matches(&event) {
                if let Err(e) = sub.tx.try_send(event.clone()) {
                    warn!(error = %e, "Subscriber lagging, event dropped");
                }
            }
        }
    }
}

/// Authoritative ledger in process memory.
///
/// # Example
///
/// ```rust,ignore
/// let ledger = Arc::new(InMemoryLedger::new());
/// ledger.set_time_lock(3600);
/// ledger.set_answer_key(AnswerKey::from_plaintext([(1, "Torii")]), None);
///
/// let client = QuestClient::new(ledger.clone(), QuestConfig::default())?;
/// ```
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                now: unix_now(),
                time_lock_secs: DEFAULT_TIME_LOCK_SECS,
                records: BTreeMap::new(),
                next_record: 0,
                next_tx: 0,
                answer_key: AnswerKey::default(),
                wisdom_threshold: None,
                collections: HashSet::new(),
                holdings: HashSet::new(),
                history: Vec::new(),
                held: Vec::new(),
                subscribers: Vec::new(),
                faults: LedgerFaults::default(),
                reads: Vec::new(),
                writes: 0,
                subscriptions: 0,
            }),
        }
    }

    // === Ledger rules ===

    /// Ledger clock
    pub fn now(&self) -> Timestamp {
        lock(&self.state).now
    }

    pub fn advance(&self, secs: u64) {
        let mut state = lock(&self.state);
        state.now = state.now.saturating_add(secs);
    }

    pub fn set_time_lock(&self, secs: u64) {
        lock(&self.state).time_lock_secs = secs;
    }

    /// Publish the correct commitments and the pass threshold (`None` = all)
    pub fn set_answer_key(&self, key: AnswerKey, threshold: Option<usize>) {
        let mut state = lock(&self.state);
        state.answer_key = key;
        state.wisdom_threshold = threshold;
    }

    pub fn allow_collection(&self, collection: Address) {
        lock(&self.state).collections.insert(collection);
    }

    /// Give `owner` a token of `collection`
    pub fn grant_token(&self, owner: Address, collection: Address) {
        lock(&self.state).holdings.insert((owner, collection));
    }

    /// Completion flags of a record
    pub fn progress_of(&self, record_id: RecordId) -> Option<TrialFlags> {
        lock(&self.state).records.get(&record_id).map(|r| r.completed)
    }

    // === Fault injection ===

    pub fn faults(&self) -> LedgerFaults {
        lock(&self.state).faults.clone()
    }

    pub fn set_faults(&self, faults: LedgerFaults) {
        let release = {
            let mut state = lock(&self.state);
            let release = state.faults.hold_events && !faults.hold_events;
            state.faults = faults;
            release
        };
        if release {
            self.release_events();
        }
    }

    pub fn set_replay_history(&self, replay: bool) {
        lock(&self.state).faults.replay_history = replay;
    }

    pub fn hold_events(&self, hold: bool) {
        let mut faults = self.faults();
        faults.hold_events = hold;
        self.set_faults(faults);
    }

    pub fn lose_receipts(&self, lose: bool) {
        lock(&self.state).faults.lose_receipts = lose;
    }

    pub fn set_receipt_delay(&self, delay: Option<Duration>) {
        lock(&self.state).faults.receipt_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        lock(&self.state).faults.read_delay = delay;
    }

    pub fn set_revert_in_receipt(&self, revert: bool) {
        lock(&self.state).faults.revert_in_receipt = revert;
    }

    pub fn set_transport_down(&self, down: bool) {
        lock(&self.state).faults.transport_down = down;
    }

    /// Deliver every held event, in emission order
    pub fn release_events(&self) {
        let mut state = lock(&self.state);
        let held = std::mem::take(&mut state.held);
        debug!(count = held.len(), "Releasing held events");
        for event in held {
            state.deliver(event);
        }
    }

    /// Push an event to subscribers without a write (e.g. seen from another session)
    pub fn emit(&self, event: LedgerEvent) {
        lock(&self.state).publish(vec![event]);
    }

    // === Counters ===

    pub fn reads_of(&self, predicate: impl Fn(&LedgerQuery) -> bool) -> usize {
        lock(&self.state).reads.iter().filter(|q| predicate(q)).count()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions
    }

    fn read_now(&self, query: &LedgerQuery) -> Result<LedgerValue, GatewayError> {
        let mut state = lock(&self.state);
        state.reads.push(query.clone());
        if state.faults.transport_down {
            return Err(GatewayError::Transport("ledger unreachable".into()));
        }
        let value = match query {
            LedgerQuery::BalanceOf(owner) => LedgerValue::Count(state.owned_by(owner).count() as u64),
            LedgerQuery::OwnerOf(id) => LedgerValue::Owner(state.records.get(id).map(|r| r.owner.clone())),
            LedgerQuery::Progress(id) => {
                let record = state
                    .records
                    .get(id)
                    .ok_or(GatewayError::Rejected(RejectReason::UnknownRecord))?;
                LedgerValue::Progress(record.completed)
            }
            LedgerQuery::CreatedAt(id) => {
                let record = state
                    .records
                    .get(id)
                    .ok_or(GatewayError::Rejected(RejectReason::UnknownRecord))?;
                LedgerValue::Timestamp(record.created_at)
            }
            LedgerQuery::TimeLockDuration => LedgerValue::Seconds(state.time_lock_secs),
        };
        Ok(value)
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn read(&self, query: &LedgerQuery) -> Result<LedgerValue, GatewayError> {
        let delay = lock(&self.state).faults.read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.read_now(query)
    }

    async fn write(&self, caller: &Address, call: &LedgerCall) -> Result<Receipt, GatewayError> {
        let (faults, receipt) = {
            let mut state = lock(&self.state);
            state.writes += 1;
            if state.faults.transport_down {
                return Err(GatewayError::Transport("ledger unreachable".into()));
            }
            let (receipt, events) = match state.apply(caller, call) {
                Ok(applied) => applied,
                Err(reason) => {
                    debug!(caller = %caller, entrypoint = call.entrypoint(), reason = %reason, "Write rejected");
                    if !state.faults.revert_in_receipt {
                        return Err(GatewayError::Rejected(reason));
                    }
                    let receipt = Receipt {
                        tx_hash: state.tx_hash(),
                        status: ReceiptStatus::Reverted(reason),
                    };
                    (receipt, Vec::new())
                }
            };
            debug!(caller = %caller, entrypoint = call.entrypoint(), tx_hash = %receipt.tx_hash, "Write applied");
            state.publish(events);
            (state.faults.clone(), receipt)
        };

        if faults.lose_receipts {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = faults.receipt_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(receipt)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, GatewayError> {
        let mut state = lock(&self.state);
        if state.faults.transport_down {
            return Err(GatewayError::Transport("ledger unreachable".into()));
        }
        state.subscriptions += 1;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        if state.faults.replay_history {
            for event in state.history.iter().filter(|e| filter.matches(e)) {
                if tx.try_send(event.clone()).is_err() {
                    warn!(filter = ?filter, "History replay truncated");
                    break;
                }
            }
        }
        state.subscribers.push(Subscriber { filter, tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::types::TrialKind;

    fn alice() -> Address {
        Address::new("0xa11ce")
    }

    async fn minted(ledger: &InMemoryLedger) -> RecordId {
        ledger.write(&alice(), &LedgerCall::Mint).await.unwrap();
        RecordId(1)
    }

    fn complete(record_id: RecordId, payload: TrialPayload) -> LedgerCall {
        LedgerCall::CompleteTrial { record_id, payload }
    }

    #[tokio::test]
    async fn test_mint_once_per_owner() {
        let ledger = InMemoryLedger::new();
        minted(&ledger).await;
        let err = ledger.write(&alice(), &LedgerCall::Mint).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(RejectReason::Other(_))));

        let query = LedgerQuery::BalanceOf(alice());
        assert_eq!(ledger.read(&query).await.unwrap(), LedgerValue::Count(1));
    }

    #[tokio::test]
    async fn test_spirit_respects_time_lock() {
        let ledger = InMemoryLedger::new();
        ledger.set_time_lock(3600);
        let record_id = minted(&ledger).await;
        let call = complete(record_id, TrialPayload::Spirit { vow: "I pledge".into() });

        let err = ledger.write(&alice(), &call).await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected(RejectReason::TimeLockActive));

        ledger.advance(3600);
        ledger.write(&alice(), &call).await.unwrap();
        assert!(ledger.progress_of(record_id).unwrap().get(TrialKind::Spirit));

        let again = ledger.write(&alice(), &call).await.unwrap_err();
        assert_eq!(again, GatewayError::Rejected(RejectReason::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_wisdom_checks_commitments() {
        let ledger = InMemoryLedger::new();
        ledger.set_answer_key(AnswerKey::from_plaintext([(1, "Torii"), (2, "Katana")]), None);
        let record_id = minted(&ledger).await;

        let wrong = SealedAnswers::new(vec![(1, commit(1, "Torii")), (2, commit(2, "Sozo"))]);
        let err = ledger
            .write(&alice(), &complete(record_id, TrialPayload::Wisdom { answers: wrong }))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Rejected(RejectReason::IncorrectAnswers));

        let right = SealedAnswers::new(vec![(1, commit(1, "Torii")), (2, commit(2, "Katana"))]);
        ledger
            .write(&alice(), &complete(record_id, TrialPayload::Wisdom { answers: right }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_technique_needs_allowlisted_holding() {
        let ledger = InMemoryLedger::new();
        let collection = Address::new("0xc011");
        ledger.allow_collection(collection.clone());
        let record_id = minted(&ledger).await;
        let call = complete(record_id, TrialPayload::Technique { collection: collection.clone() });

        assert!(ledger.write(&alice(), &call).await.is_err());
        ledger.grant_token(alice(), collection);
        assert!(ledger.write(&alice(), &call).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_owner_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.set_time_lock(0);
        let record_id = minted(&ledger).await;
        let err = ledger
            .write(&Address::new("0xb0b"), &complete(record_id, TrialPayload::Spirit { vow: "x".into() }))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Rejected(RejectReason::NotOwner));
    }

    #[tokio::test]
    async fn test_history_replay_and_hold() {
        let ledger = InMemoryLedger::new();
        minted(&ledger).await;

        let mut replayed = ledger.subscribe(EventFilter::MintedBy(alice())).await.unwrap();
        assert!(matches!(replayed.try_recv(), Ok(LedgerEvent::RecordMinted { .. })));

        ledger.set_time_lock(0);
        ledger.hold_events(true);
        let mut live = ledger.subscribe(EventFilter::CompletionsOf(RecordId(1))).await.unwrap();
        ledger
            .write(&alice(), &complete(RecordId(1), TrialPayload::Spirit { vow: "x".into() }))
            .await
            .unwrap();
        assert!(live.try_recv().is_err());

        ledger.hold_events(false);
        assert!(matches!(live.try_recv(), Ok(LedgerEvent::TrialCompleted { trial: TrialKind::Spirit, .. })));
    }

    #[tokio::test]
    async fn test_reverted_receipt() {
        let ledger = InMemoryLedger::new();
        ledger.set_revert_in_receipt(true);
        let record_id = minted(&ledger).await;

        let receipt = ledger
            .write(&alice(), &complete(record_id, TrialPayload::Spirit { vow: "x".into() }))
            .await
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted(RejectReason::TimeLockActive));
        assert!(!ledger.progress_of(record_id).unwrap().get(TrialKind::Spirit));
    }

    #[tokio::test]
    async fn test_transport_down() {
        let ledger = InMemoryLedger::new();
        ledger.set_transport_down(true);
        let err = ledger.write(&alice(), &LedgerCall::Mint).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(ledger.progress_of(RecordId(1)).is_none());
    }
}
