//! Session-level client
//!
//! `QuestClient` is what an application holds: connect a signer, read and
//! subscribe to progress, submit trials, and ask the time-lock gate.

mod quest_client;

pub use quest_client::QuestClient;
