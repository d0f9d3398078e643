//! Wallet Synchronization Module
//!
//! This module provides the core services for synchronizing an HD wallet with a chain-indexing
//! server. The services never call each other directly; they communicate through the event bus:
//!
//! - `events`: Event types, handler traits and the two event bus implementations.
//! - `address_ledger`: Derived and queried addresses plus the last used index of each chain.
//! - `strategies`: Per-chain derivation strategies and the synchronization configuration.
//! - `history`: The history synchronizer running the gap-limit discovery and reconciliation.
//! - `transaction_processor`: Maps raw transactions into log records, resolving inputs.
//! - `transaction_log`: The append-only, id-indexed transaction log.
//! - `balance`: The UTXO set and confirmed / unconfirmed totals.
//! - `repositories` and `state_persistence`: Storage of the transaction log and the indices.
//! - `progress_tracker`: Statistics of one synchronization pass.

/// Address ledger for the main and change chains
pub mod address_ledger;
/// UTXO set and balances maintained from events
pub mod balance;
/// Event system for decoupled communication during sync
pub mod events;
/// Gap-limit discovery and transaction reconciliation
pub mod history;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Storage backends for the transaction log and address indices
pub mod repositories;
/// Persistence service over the repositories
pub mod state_persistence;
/// Per-chain derivation strategies
pub mod strategies;
/// Append-only transaction log
pub mod transaction_log;
/// Transaction parsing and input resolution
pub mod transaction_processor;

pub use address_ledger::AddressLedger;
pub use balance::{BalanceLedger, SpendableCoin, UtxoRecord};
pub use events::{DeterministicEventBus, EventBus, EventBusExt, QueuedEventBus};
pub use history::{HistorySynchronizer, SyncOutcome};
pub use progress_tracker::SyncStats;
pub use state_persistence::StatePersistenceService;
pub use strategies::{ChainDerivationStrategy, DerivationStrategy, SyncConfig};
pub use transaction_log::TransactionLog;
pub use transaction_processor::TransactionProcessor;
