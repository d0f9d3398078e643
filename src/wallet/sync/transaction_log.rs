//! The wallet's append-only transaction log.
//!
//! Records are appended once per transaction id and afterwards only updated in place. Readers get
//! cloned snapshots, so a UI polling the log never observes a half-applied update.

use crate::wallet::TransactionRecord;

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct LogState {
    records: Vec<TransactionRecord>,
    positions: HashMap<String, usize>,
}

/// Ordered, id-indexed collection of transaction records
#[derive(Debug, Default)]
pub struct TransactionLog {
    state: RwLock<LogState>,
}

impl TransactionLog {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        let log = Self::default();
        for record in records {
            log.insert(record);
        }
        log
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of every record in insertion order
    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        self.read().records.clone()
    }

    pub fn get(&self, tx_id: &str) -> Option<TransactionRecord> {
        let state = self.read();
        state
            .positions
            .get(tx_id)
            .map(|position| state.records[*position].clone())
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.read().positions.contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record. Returns false, leaving the log untouched, if the id is already present.
    pub fn insert(&self, record: TransactionRecord) -> bool {
        let mut state = self.write();
        if state.positions.contains_key(&record.tx_id) {
            return false;
        }
        let position = state.records.len();
        state.positions.insert(record.tx_id.clone(), position);
        state.records.push(record);
        true
    }

    /// Mutate the record for `tx_id` in place, returning what `f` returned
    pub fn update<R>(&self, tx_id: &str, f: impl FnOnce(&mut TransactionRecord) -> R) -> Option<R> {
        let mut state = self.write();
        let position = *state.positions.get(tx_id)?;
        Some(f(&mut state.records[position]))
    }

    /// Ids of every record with an input or output referencing `address`
    pub fn ids_touching(&self, address: &str) -> Vec<String> {
        self.read()
            .records
            .iter()
            .filter(|record| record.touches(address))
            .map(|record| record.tx_id.clone())
            .collect()
    }

    /// Whether any known record spends output `vout` of `tx_id`
    pub fn is_output_spent(&self, tx_id: &str, vout: u32) -> bool {
        self.read()
            .records
            .iter()
            .any(|record| record.spends(tx_id, vout))
    }
}
