//! Server state management.
//!
//! Bundles the pieces every connection task shares: the connection registry,
//! the call ledger front, and the identifier source. All of them are cheap
//! to clone.

use std::sync::Arc;

use crate::error::Result;
use crate::ledger::{LedgerHandle, SqliteCallStore};
use crate::names::{AnimalNames, NameSource};
use crate::registry::ConnectionRegistry;

/// Default capacity of the call ledger queue.
const DEFAULT_LEDGER_QUEUE_CAPACITY: usize = 1024;

/// Default interval between call-count log lines (5 minutes).
const DEFAULT_STATS_INTERVAL_SECS: u64 = 300;

/// Default interval between full call dumps (1 hour).
const DEFAULT_DUMP_INTERVAL_SECS: u64 = 3600;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite database path, or `:memory:`.
    pub database_path: String,
    pub ledger_queue_capacity: usize,
    pub stats_interval_secs: u64,
    /// 0 disables the periodic call dump.
    pub dump_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: "calls.db".to_string(),
            ledger_queue_capacity: DEFAULT_LEDGER_QUEUE_CAPACITY,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            dump_interval_secs: DEFAULT_DUMP_INTERVAL_SECS,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Identifier → outbound handle for every connected participant.
    pub registry: ConnectionRegistry,

    /// Queue into the call ledger worker.
    pub ledger: LedgerHandle,

    /// Where new connections get their identifier candidates from.
    pub names: Arc<dyn NameSource>,

    pub config: RelayConfig,
}

impl RelayState {
    /// Open the configured database and start the ledger worker.
    pub fn open(config: RelayConfig) -> Result<Self> {
        let store = SqliteCallStore::open(&config.database_path)?;
        let ledger = LedgerHandle::spawn(store, config.ledger_queue_capacity);
        Ok(Self::with_ledger(config, ledger))
    }

    pub fn with_ledger(config: RelayConfig, ledger: LedgerHandle) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            ledger,
            names: Arc::new(AnimalNames),
            config,
        }
    }

    /// In-memory state for tests.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        let config = RelayConfig {
            database_path: ":memory:".to_string(),
            ..RelayConfig::default()
        };
        Self::open(config).expect("in-memory relay state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_path, "calls.db");
        assert_eq!(config.ledger_queue_capacity, 1024);
        assert_eq!(config.stats_interval_secs, 300);
        assert_eq!(config.dump_interval_secs, 3600);
    }

    #[tokio::test]
    async fn test_state_creation() {
        let state = RelayState::in_memory();
        assert_eq!(state.registry.online_count(), 0);
        assert_eq!(state.ledger.count_calls().await.unwrap(), 0);
    }
}
