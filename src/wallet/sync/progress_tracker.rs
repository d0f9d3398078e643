//! Progress tracking for wallet synchronization.
//!
//! This module provides the `SyncProgressTracker`, which records what a synchronization pass did:
//! how many addresses were scanned on each chain, the last address that had any history, how many
//! transactions were added to or refreshed in the log, and how many network calls failed.
//!
//! The tracker is owned by a single `sync_all` call and turned into `SyncStats` at the end, which
//! are logged and handed back to the caller.

use crate::wallet::Chain;
use std::time::{Duration, Instant};
use tracing::info;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    started_at: Instant,
    /// Addresses queried on the main chain
    main_scanned: u32,
    /// Addresses queried on the change chain
    change_scanned: u32,
    /// Highest index with history on the main chain
    main_last_non_empty: Option<u32>,
    /// Highest index with history on the change chain
    change_last_non_empty: Option<u32>,
    transactions_added: usize,
    transactions_updated: usize,
    failed_fetches: usize,
    /// Addresses whose history came from the local log instead of the server
    history_fallbacks: usize,
}

impl Default for SyncProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            main_scanned: 0,
            change_scanned: 0,
            main_last_non_empty: None,
            change_last_non_empty: None,
            transactions_added: 0,
            transactions_updated: 0,
            failed_fetches: 0,
            history_fallbacks: 0,
        }
    }

    /// Record that one more address on `chain` was queried
    pub fn record_scanned(&mut self, chain: Chain) {
        match chain {
            Chain::Main => self.main_scanned += 1,
            Chain::Change => self.change_scanned += 1,
        }
    }

    /// Record that the address at `index` on `chain` had history
    pub fn record_non_empty(&mut self, chain: Chain, index: u32) {
        let slot = match chain {
            Chain::Main => &mut self.main_last_non_empty,
            Chain::Change => &mut self.change_last_non_empty,
        };
        *slot = Some(slot.map_or(index, |last| last.max(index)));
    }

    pub fn record_added(&mut self) {
        self.transactions_added += 1;
    }

    pub fn record_updated(&mut self) {
        self.transactions_updated += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed_fetches += 1;
    }

    pub fn record_fallback(&mut self) {
        self.history_fallbacks += 1;
    }

    /// Log the state of one finished chain scan
    pub fn log_chain_finished(&self, chain: Chain) {
        let (scanned, last) = match chain {
            Chain::Main => (self.main_scanned, self.main_last_non_empty),
            Chain::Change => (self.change_scanned, self.change_last_non_empty),
        };
        info!(
            "Finished {} chain: {} addresses scanned, last used index {:?}",
            chain, scanned, last
        );
    }

    /// Get sync statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            main_addresses_scanned: self.main_scanned,
            change_addresses_scanned: self.change_scanned,
            main_last_non_empty: self.main_last_non_empty,
            change_last_non_empty: self.change_last_non_empty,
            transactions_added: self.transactions_added,
            transactions_updated: self.transactions_updated,
            failed_fetches: self.failed_fetches,
            history_fallbacks: self.history_fallbacks,
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Statistics about one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub main_addresses_scanned: u32,
    pub change_addresses_scanned: u32,
    pub main_last_non_empty: Option<u32>,
    pub change_last_non_empty: Option<u32>,
    pub transactions_added: usize,
    pub transactions_updated: usize,
    pub failed_fetches: usize,
    pub history_fallbacks: usize,
    pub elapsed: Duration,
}

impl SyncStats {
    pub fn addresses_scanned(&self, chain: Chain) -> u32 {
        match chain {
            Chain::Main => self.main_addresses_scanned,
            Chain::Change => self.change_addresses_scanned,
        }
    }

    pub fn last_non_empty(&self, chain: Chain) -> Option<u32> {
        match chain {
            Chain::Main => self.main_last_non_empty,
            Chain::Change => self.change_last_non_empty,
        }
    }

    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "Scanned {} main / {} change addresses: {} transactions added, {} updated in {:.1?}{}",
            self.main_addresses_scanned,
            self.change_addresses_scanned,
            self.transactions_added,
            self.transactions_updated,
            self.elapsed,
            if self.failed_fetches == 0 {
                String::new()
            } else {
                format!(
                    " ({} failed fetches, {} addresses from local history)",
                    self.failed_fetches, self.history_fallbacks
                )
            }
        )
    }
}
