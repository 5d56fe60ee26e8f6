//! Interfaces to the external collaborators
//!
//! The engine is written against these traits only. Production code plugs in
//! an RPC/indexer-backed gateway; tests plug in `InMemoryLedger`.

mod gateway;
mod signer;

pub use gateway::{
    EventFilter, EventStream, LedgerCall, LedgerEvent, LedgerGateway, LedgerQuery, LedgerValue,
    Receipt, ReceiptStatus, TrialPayload,
};
pub use signer::{GatewaySigner, SessionSigner};
