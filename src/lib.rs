//! Synchronization core of an HD bitcoin wallet.
//!
//! Discovers used addresses with a gap-limit scan against an Electrum server, keeps an
//! append-only transaction log, and maintains the UTXO set and balances as event-driven views.

pub mod config;
pub mod electrum;
pub mod transaction;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod test_support;
