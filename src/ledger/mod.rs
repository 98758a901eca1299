//! Call ledger: the audit trail of calls relayed through this server.
//!
//! ## Lifecycle
//!
//! 1. An `offer` is delivered → an open record `(from, to, start_time)` is inserted
//! 2. A `hangup` arrives → the matching open record gets `end_time` and `duration`
//! 3. A hangup with no matching record is logged and ignored (duplicate
//!    hangups and races are expected)
//!
//! Records live only in the store. Nothing is cached between events.

pub mod api;
pub mod service;
pub mod store;
pub mod types;

pub use service::LedgerHandle;
pub use store::SqliteCallStore;
#[cfg(test)]
pub use types::CallRecord;
