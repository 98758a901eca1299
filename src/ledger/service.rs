//! Call lifecycle bookkeeping.
//!
//! [`CallLedger`] holds the rules for opening and closing call records.
//! It never runs on the relay path: [`LedgerHandle`] queues [`LedgerEvent`]s
//! on a bounded channel and a worker on the blocking pool applies them in
//! order. A slow or failing store only shows up in [`LedgerStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use super::store::CallStore;
use super::types::{duration_secs, CallMatch, CallRecord, ClosedCall, LedgerStats};
use crate::error::{RelayError, Result};

/// Work items for the ledger worker.
#[derive(Debug)]
pub enum LedgerEvent {
    /// An offer was delivered from `from` to `to`.
    CallStarted { from: String, to: String },
    /// `from` hung up. Without `to`, the worker searches for the open call
    /// and replies with the counterpart so the hangup can be routed.
    CallEnded {
        from: String,
        to: Option<String>,
        reply: Option<oneshot::Sender<Option<String>>>,
    },
    CountCalls { reply: oneshot::Sender<Result<u64>> },
    ListCalls {
        limit: Option<usize>,
        reply: oneshot::Sender<Result<Vec<CallRecord>>>,
    },
}

#[derive(Debug, Default)]
struct LedgerMetrics {
    calls_started: AtomicU64,
    calls_ended: AtomicU64,
    inconsistencies: AtomicU64,
    store_errors: AtomicU64,
    dropped_events: AtomicU64,
}

impl LedgerMetrics {
    fn snapshot(&self) -> LedgerStats {
        LedgerStats {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_ended: self.calls_ended.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

/// Call record rules on top of a [`CallStore`].
pub struct CallLedger<S: CallStore> {
    store: S,
    metrics: Arc<LedgerMetrics>,
}

impl<S: CallStore> CallLedger<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            metrics: Arc::new(LedgerMetrics::default()),
        }
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> LedgerStats {
        self.metrics.snapshot()
    }

    /// Open a call record. Only call this once the offer was delivered.
    pub fn record_call_start(&self, from: &str, to: &str) -> Result<i64> {
        self.record_call_start_at(from, to, Utc::now())
    }

    pub fn record_call_start_at(&self, from: &str, to: &str, now: DateTime<Utc>) -> Result<i64> {
        let id = self.store.insert_open_call(from, to, now)?;
        tracing::info!(call_id = id, from = from, to = to, "Call start logged");
        Ok(id)
    }

    /// Close the open call `from` takes part in.
    ///
    /// With a non-empty `to` the call must be between the two (either
    /// direction). Without one, any open call involving `from` qualifies and
    /// its other party becomes the counterpart. When several calls qualify
    /// the most recently started one is closed.
    pub fn record_call_end(&self, from: &str, to: Option<&str>) -> Result<ClosedCall> {
        self.record_call_end_at(from, to, Utc::now())
    }

    pub fn record_call_end_at(
        &self,
        from: &str,
        to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ClosedCall> {
        let to = to.filter(|t| !t.is_empty());
        let filter = match to {
            Some(to) => CallMatch::Between(from, to),
            None => CallMatch::Involving(from),
        };

        let inconsistent = || RelayError::StateInconsistency {
            from: from.to_string(),
            to: to.map(str::to_string),
        };

        let open = self.store.find_open_call(&filter)?.ok_or_else(inconsistent)?;

        let end_time = now.max(open.start_time);
        let duration = duration_secs(open.start_time, end_time);

        // Someone else closed it between the lookup and now.
        if !self.store.close_call(open.id, end_time, duration)? {
            return Err(inconsistent());
        }

        let record = CallRecord {
            end_time: Some(end_time),
            duration,
            ..open
        };
        let confirmed = self.confirm_closed(&record);

        tracing::info!(
            call_id = record.id,
            from = record.from.as_str(),
            to = record.to.as_str(),
            duration_secs = duration,
            confirmed = confirmed,
            "Call ended and logged"
        );

        Ok(ClosedCall { record, confirmed })
    }

    /// Read a just-closed record back. If the read fails, try once more by
    /// participants without the open filter. Never undoes the write.
    fn confirm_closed(&self, record: &CallRecord) -> bool {
        match self.store.get_call(record.id) {
            Ok(Some(stored)) => return !stored.is_open(),
            Ok(None) => {
                tracing::warn!(call_id = record.id, "Closed call missing on re-read, retrying");
            }
            Err(e) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call_id = record.id, error = %e, "Could not re-read closed call, retrying");
            }
        }

        match self.store.find_call(&CallMatch::Between(&record.from, &record.to)) {
            Ok(Some(stored)) => stored.id == record.id && !stored.is_open(),
            Ok(None) => false,
            Err(e) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call_id = record.id, error = %e, "Could not re-read closed call");
                false
            }
        }
    }

    pub fn count_calls(&self) -> Result<u64> {
        self.store.count_calls()
    }

    pub fn list_calls(&self, limit: Option<usize>) -> Result<Vec<CallRecord>> {
        self.store.list_calls(limit)
    }

    /// Apply one queued event, logging and counting failures.
    pub fn apply(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::CallStarted { from, to } => match self.record_call_start(&from, &to) {
                Ok(_) => {
                    self.metrics.calls_started.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(from = from.as_str(), to = to.as_str(), error = %e, "Error logging call start");
                }
            },

            LedgerEvent::CallEnded { from, to, reply } => {
                let counterpart = match self.record_call_end(&from, to.as_deref()) {
                    Ok(closed) => {
                        self.metrics.calls_ended.fetch_add(1, Ordering::Relaxed);
                        Some(closed.record.counterpart(&from).to_string())
                    }
                    Err(e @ RelayError::StateInconsistency { .. }) => {
                        self.metrics.inconsistencies.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "Hangup without an open call");
                        None
                    }
                    Err(e) => {
                        self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(from = from.as_str(), error = %e, "Error updating call");
                        None
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(counterpart);
                }
            }

            LedgerEvent::CountCalls { reply } => {
                let result = self.count_calls();
                if result.is_err() {
                    self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }

            LedgerEvent::ListCalls { limit, reply } => {
                let result = self.list_calls(limit);
                if result.is_err() {
                    self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
        }
    }
}

/// Cheap, cloneable front for the ledger worker.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerEvent>,
    metrics: Arc<LedgerMetrics>,
}

impl LedgerHandle {
    /// Start the worker on the blocking pool. It runs until every handle is dropped.
    pub fn spawn<S: CallStore>(store: S, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let ledger = CallLedger::new(store);
        let metrics = ledger.metrics.clone();

        tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                ledger.apply(event);
            }
            tracing::info!("Call ledger worker stopped");
        });

        Self { tx, metrics }
    }

    /// A handle whose worker is already gone; every event is dropped.
    #[cfg(test)]
    pub fn stopped() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            metrics: Arc::new(LedgerMetrics::default()),
        }
    }

    pub fn stats(&self) -> LedgerStats {
        self.metrics.snapshot()
    }

    /// Queue a call start. Never waits; a full queue drops the event.
    pub fn call_started(&self, from: &str, to: &str) {
        self.enqueue(LedgerEvent::CallStarted {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Queue a hangup whose counterpart is already known.
    pub fn call_ended(&self, from: &str, to: &str) {
        self.enqueue(LedgerEvent::CallEnded {
            from: from.to_string(),
            to: Some(to.to_string()),
            reply: None,
        });
    }

    /// Close the open call involving `from` and return its other party.
    /// `None` if there is no open call or the ledger could not answer.
    pub async fn hangup_without_target(&self, from: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let queued = self.enqueue(LedgerEvent::CallEnded {
            from: from.to_string(),
            to: None,
            reply: Some(reply),
        });
        if !queued {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn count_calls(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LedgerEvent::CountCalls { reply })
            .await
            .map_err(|_| RelayError::LedgerUnavailable)?;
        rx.await.map_err(|_| RelayError::LedgerUnavailable)?
    }

    pub async fn list_calls(&self, limit: Option<usize>) -> Result<Vec<CallRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LedgerEvent::ListCalls { limit, reply })
            .await
            .map_err(|_| RelayError::LedgerUnavailable)?;
        rx.await.map_err(|_| RelayError::LedgerUnavailable)?
    }

    fn enqueue(&self, event: LedgerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = ?event, "Call ledger queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event = ?event, "Call ledger worker stopped, dropping event");
                false
            }
        }
    }
}
