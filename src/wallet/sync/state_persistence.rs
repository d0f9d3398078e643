//! State persistence service for wallet synchronization.
//!
//! This module provides the `StatePersistenceService`, which stores the transaction log and the
//! last used address index of each chain. It uses repository traits to abstract the details of
//! persistence so the same service works against files in production and memory in tests.
//!
//! The history synchronizer saves the transaction log at the end of every synchronization pass,
//! and the address ledger stores a chain's index whenever the chain is extended. Both are read
//! back once on startup.

use crate::wallet::sync::repositories::{
    AddressIndexRepository, FileAddressIndexRepository, FileTransactionRepository,
    InMemoryAddressIndexRepository, InMemoryTransactionRepository, TransactionRepository,
};
use crate::wallet::{Chain, TransactionRecord, WalletSyncError};

use std::path::PathBuf;
use tracing::info;

/// Service for managing state persistence operations.
pub struct StatePersistenceService {
    transaction_repo: Box<dyn TransactionRepository>,
    index_repo: Box<dyn AddressIndexRepository>,
}

impl StatePersistenceService {
    /// Create a new state persistence service for the given data directory.
    pub fn new(data_dir: PathBuf) -> Self {
        info!("Persisting wallet state under {:?}", data_dir);
        Self {
            transaction_repo: Box::new(FileTransactionRepository::new(data_dir.clone())),
            index_repo: Box::new(FileAddressIndexRepository::new(data_dir)),
        }
    }

    /// Create a service that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self::with_repositories(
            Box::new(InMemoryTransactionRepository::default()),
            Box::new(InMemoryAddressIndexRepository::default()),
        )
    }

    pub fn with_repositories(
        transaction_repo: Box<dyn TransactionRepository>,
        index_repo: Box<dyn AddressIndexRepository>,
    ) -> Self {
        Self {
            transaction_repo,
            index_repo,
        }
    }

    /// Replace the stored transaction log with `transactions`.
    pub async fn save_transactions(
        &self,
        transactions: &[TransactionRecord],
    ) -> Result<(), WalletSyncError> {
        self.transaction_repo.save(transactions).await
    }

    /// Load the stored transaction log, empty if nothing was saved yet.
    pub async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, WalletSyncError> {
        self.transaction_repo.load().await
    }

    /// Last used index of `chain`, `None` if the chain was never extended.
    pub async fn last_index(&self, chain: Chain) -> Result<Option<u32>, WalletSyncError> {
        self.index_repo.last_index(chain).await
    }

    pub async fn set_last_index(&self, chain: Chain, index: u32) -> Result<(), WalletSyncError> {
        self.index_repo.set_last_index(chain, index).await
    }
}
