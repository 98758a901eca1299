//! Call ledger types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited call between two participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    /// The participant who sent the offer.
    pub from: String,
    /// The participant the offer was delivered to.
    pub to: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the call is open.
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end; 0 while open.
    pub duration: f64,
}

impl CallRecord {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// The other party of this call, seen from `id`.
    pub fn counterpart(&self, id: &str) -> &str {
        if self.from == id {
            &self.to
        } else {
            &self.from
        }
    }
}

/// Which calls a store lookup should consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMatch<'a> {
    /// Calls between the two participants, in either direction.
    Between(&'a str, &'a str),
    /// Calls where the participant is either caller or callee.
    Involving(&'a str),
}

/// Result of a successful hangup.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCall {
    /// The record as written.
    pub record: CallRecord,
    /// Whether the write was read back from the store.
    pub confirmed: bool,
}

/// Seconds elapsed from `start` to `end`, never negative.
pub fn duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Counter snapshot, served on `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub calls_started: u64,
    pub calls_ended: u64,
    pub inconsistencies: u64,
    pub store_errors: u64,
    pub dropped_events: u64,
}
