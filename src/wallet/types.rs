use crate::electrum::ChainClientError;

use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two BIP32 address sequences of the wallet account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
	/// Receiving addresses (`.../0/i`)
	Main,
	/// Change addresses (`.../1/i`)
	Change,
}

impl Chain {
	pub const ALL: [Chain; 2] = [Chain::Main, Chain::Change];

	/// BIP32 child number selecting this chain below the account key
	pub fn child_index(self) -> u32 {
		match self {
			Chain::Main => 0,
			Chain::Change => 1,
		}
	}
}

impl fmt::Display for Chain {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Chain::Main => f.write_str("main"),
			Chain::Change => f.write_str("change"),
		}
	}
}

/// Stored view of a transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
	/// Destination address, `None` for scripts without an address form
	pub address: Option<String>,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub is_user_address: bool,
}

/// Stored view of a transaction input with the spent output resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
	pub prev_tx_id: String,
	pub prev_output_index: u32,
	pub address: Option<String>,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub is_user_address: bool,
}

/// A wallet transaction as kept in the local transaction log.
///
/// Records are created once per transaction id and then only mutated in place: the confirmed flag
/// moves from false to true, an epoch date is replaced by the real block time, and input/output
/// ownership flags are raised as more addresses get queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
	pub tx_id: String,
	pub raw_hex: String,
	pub date: DateTime<Utc>,
	pub confirmed: bool,
	pub outputs: Vec<OutputRecord>,
	pub inputs: Vec<InputRecord>,
}

impl TransactionRecord {
	/// Index of the first output paying `address`
	pub fn output_index_for(&self, address: &str) -> Option<usize> {
		self.outputs
			.iter()
			.position(|output| output.address.as_deref() == Some(address))
	}

	/// Whether any input or output of this transaction references `address`
	pub fn touches(&self, address: &str) -> bool {
		self.outputs
			.iter()
			.any(|output| output.address.as_deref() == Some(address))
			|| self
				.inputs
				.iter()
				.any(|input| input.address.as_deref() == Some(address))
	}

	/// Whether this transaction spends output `vout` of `tx_id`
	pub fn spends(&self, tx_id: &str, vout: u32) -> bool {
		self.inputs
			.iter()
			.any(|input| input.prev_tx_id == tx_id && input.prev_output_index == vout)
	}

	pub fn has_unknown_date(&self) -> bool {
		is_epoch(&self.date)
	}
}

/// Sentinel date for transactions whose block time is not known yet
pub fn epoch() -> DateTime<Utc> {
	DateTime::<Utc>::default()
}

pub fn is_epoch(date: &DateTime<Utc>) -> bool {
	date.timestamp() == 0
}

/// Error types for wallet synchronization and the ledgers built on top of it
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Network error: {0}")]
	Network(#[from] ChainClientError),

	#[error("Transaction parse error: {0}")]
	ParseError(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Persistence error: {0}")]
	Persistence(String),

	#[error("Address index for {chain} chain cannot move from {last:?} back to {requested}")]
	IndexOrdering {
		chain: Chain,
		requested: u32,
		last: Option<u32>,
	},

	#[error("Key derivation error: {0}")]
	Derivation(String),

	#[error("Sync error: {0}")]
	SyncError(String),

	#[error("Handler panicked: {0}")]
	HandlerPanicked(String),
}
