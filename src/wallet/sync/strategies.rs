use crate::config::DEFAULT_GAP_LIMIT;
use crate::wallet::sync::address_ledger::AddressLedger;
use crate::wallet::sync::events::{AddressRangeExtended, EventBus, EventBusExt};
use crate::wallet::{Chain, WalletSyncError};

use std::sync::Arc;
use tracing::info;

/// Binds the chain-agnostic discovery loop to one derivation chain
pub trait DerivationStrategy: Send + Sync {
	fn chain(&self) -> Chain;

	/// Last index known to be used on this chain
	fn last_known_index(&self) -> Option<u32>;

	fn derive_address(&self, index: u32) -> Result<String, WalletSyncError>;

	/// Announce that addresses up to `new_last_index` have history
	fn publish_range_extended(&self, new_last_index: u32);

	fn mark_queried(&self, index: u32) -> Result<(), WalletSyncError>;

	/// Get the name of this strategy
	fn name(&self) -> &'static str;
}

/// Configuration for history synchronization
#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Consecutive empty addresses after which a chain scan stops
	pub gap_limit: u32,
	/// Confirmations after which a stored transaction is considered final
	pub confirmation_threshold: u32,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			gap_limit: DEFAULT_GAP_LIMIT,
			confirmation_threshold: 6,
		}
	}
}

impl SyncConfig {
	pub fn with_gap_limit(gap_limit: u32) -> Self {
		Self {
			gap_limit: gap_limit.max(1),
			..Self::default()
		}
	}
}

/// Strategy backed by the address ledger, publishing range extensions on the bus
pub struct ChainDerivationStrategy {
	chain: Chain,
	ledger: Arc<AddressLedger>,
	bus: Arc<dyn EventBus>,
}

impl ChainDerivationStrategy {
	pub fn new(chain: Chain, ledger: Arc<AddressLedger>, bus: Arc<dyn EventBus>) -> Self {
		Self { chain, ledger, bus }
	}

	/// Strategy for receiving addresses
	pub fn main(ledger: Arc<AddressLedger>, bus: Arc<dyn EventBus>) -> Self {
		Self::new(Chain::Main, ledger, bus)
	}

	/// Strategy for change addresses
	pub fn change(ledger: Arc<AddressLedger>, bus: Arc<dyn EventBus>) -> Self {
		Self::new(Chain::Change, ledger, bus)
	}
}

impl DerivationStrategy for ChainDerivationStrategy {
	fn chain(&self) -> Chain {
		self.chain
	}

	fn last_known_index(&self) -> Option<u32> {
		self.ledger.last_index(self.chain)
	}

	fn derive_address(&self, index: u32) -> Result<String, WalletSyncError> {
		self.ledger.derive_at(self.chain, index)
	}

	fn publish_range_extended(&self, new_last_index: u32) {
		info!(
			"Found used {} addresses up to index {}",
			self.chain, new_last_index
		);
		self.bus.publish(AddressRangeExtended {
			chain: self.chain,
			new_last_index,
		});
	}

	fn mark_queried(&self, index: u32) -> Result<(), WalletSyncError> {
		self.ledger.mark_queried(self.chain, index)
	}

	fn name(&self) -> &'static str {
		match self.chain {
			Chain::Main => "MainChainStrategy",
			Chain::Change => "ChangeChainStrategy",
		}
	}
}
