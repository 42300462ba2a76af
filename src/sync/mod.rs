//! Client-side sequencing state
//!
//! `Client` wraps a merge tree with everything needed to talk to a total-order
//! sequencer: provisional local stamps, the pending-op queue matched against
//! acknowledgments, and the inbound queue used while loading.

pub mod client;
pub mod pending;

pub use client::{Client, ClientState};
pub use pending::{MessageQueue, PendingOp, PendingOps};
