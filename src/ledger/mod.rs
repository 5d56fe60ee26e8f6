//! Ledger backends
//!
//! `InMemoryLedger` is a complete, authoritative ledger held in process
//! memory. It enforces the quest rules, emits events, replays history to new
//! subscribers the way an indexer does, and can inject the faults the engine
//! has to survive (lost receipts, held events, transport failures).

mod memory;

pub use memory::{InMemoryLedger, LedgerFaults};
