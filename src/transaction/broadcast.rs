//! Broadcast of locally built transactions.
//!
//! Submits a signed transaction to the chain server and, once accepted, publishes it on the bus
//! as an unconfirmed record so the ledgers account for it before the next synchronization.

use crate::electrum::{ChainClient, ChainClientError};
use crate::wallet::sync::events::{EventBus, EventBusExt, TransactionBroadcast};
use crate::wallet::sync::transaction_processor::TransactionProcessor;

use bitcoin::Transaction;
use bitcoin::consensus::encode::serialize_hex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferError {
	#[error("Transaction rejected: {0}")]
	Rejected(String),

	#[error("Network error: {0}")]
	Network(String),

	#[error("Response string is invalid")]
	EmptyResponse,

	/// The transaction was broadcast but could not be recorded locally
	#[error("Bookkeeping error: {0}")]
	Bookkeeping(String),
}

/// Outcome of a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
	pub success: bool,
	pub tx_id: Option<String>,
	pub error: Option<TransferError>,
}

impl TransferResult {
	fn failed(error: TransferError) -> Self {
		Self {
			success: false,
			tx_id: None,
			error: Some(error),
		}
	}
}

/// Serialized broadcast of wallet transactions
pub struct BroadcastService {
	client: Arc<dyn ChainClient>,
	processor: TransactionProcessor,
	bus: Arc<dyn EventBus>,
	lock: tokio::sync::Mutex<()>,
}

impl BroadcastService {
	pub fn new(
		client: Arc<dyn ChainClient>,
		processor: TransactionProcessor,
		bus: Arc<dyn EventBus>,
	) -> Self {
		Self {
			client,
			processor,
			bus,
			lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Broadcast `transaction`. One broadcast runs at a time; failures are reported, never raised.
	pub async fn broadcast(&self, transaction: &Transaction) -> TransferResult {
		let _guard = self.lock.lock().await;

		let raw_hex = serialize_hex(transaction);
		info!("Attempting to broadcast transaction {}", transaction.compute_txid());

		let tx_id = match self.client.broadcast(&raw_hex).await {
			Ok(tx_id) if tx_id.trim().is_empty() => {
				warn!("Transaction broadcast failed, empty response for {}", raw_hex);
				return TransferResult::failed(TransferError::EmptyResponse);
			}
			Ok(tx_id) => tx_id,
			Err(ChainClientError::Rejected(reason)) => {
				error!("[BROADCAST] Transaction rejected: {}", reason);
				return TransferResult::failed(TransferError::Rejected(reason));
			}
			Err(e) => {
				error!("[BROADCAST] Failed to broadcast transaction: {}", e);
				return TransferResult::failed(TransferError::Network(e.to_string()));
			}
		};

		match self.processor.record_from_broadcast(transaction).await {
			Ok(record) => {
				self.bus.publish(TransactionBroadcast { transaction: record });
				info!("Transaction broadcast successful. ID: {}", tx_id);
				TransferResult {
					success: true,
					tx_id: Some(tx_id),
					error: None,
				}
			}
			Err(e) => {
				error!(
					"[BROADCAST] Transaction {} was broadcast but could not be recorded: {}",
					tx_id, e
				);
				TransferResult {
					success: true,
					tx_id: Some(tx_id),
					error: Some(TransferError::Bookkeeping(e.to_string())),
				}
			}
		}
	}
}
