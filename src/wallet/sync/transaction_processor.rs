use crate::electrum::{PrevOutputLookup, TransactionDetail};
use crate::wallet::sync::address_ledger::AddressLedger;
use crate::wallet::{InputRecord, OutputRecord, TransactionRecord, WalletSyncError, epoch};

use bitcoin::{Address, Network, Transaction};
use chrono::DateTime;
use std::sync::Arc;
use tracing::{debug, error};

/// Maps raw transactions into log records, resolving inputs and address ownership
#[derive(Clone)]
pub struct TransactionProcessor {
	network: Network,
	prev_outputs: Arc<dyn PrevOutputLookup>,
	ledger: Arc<AddressLedger>,
}

impl TransactionProcessor {
	pub fn new(
		network: Network,
		prev_outputs: Arc<dyn PrevOutputLookup>,
		ledger: Arc<AddressLedger>,
	) -> Self {
		Self {
			network,
			prev_outputs,
			ledger,
		}
	}

	/// Parse raw transaction hex into a bitcoin Transaction
	pub fn parse_transaction(&self, raw_hex: &str) -> Result<Transaction, WalletSyncError> {
		let tx_bytes = hex::decode(raw_hex).map_err(|e| {
			error!("[PARSE_TRANSACTION] Failed to decode hex: {}", e);
			WalletSyncError::ParseError(format!("Failed to decode hex: {}", e))
		})?;

		let transaction: Transaction = bitcoin::consensus::deserialize(&tx_bytes).map_err(|e| {
			error!(
				"[PARSE_TRANSACTION] Failed to deserialize transaction: {}",
				e
			);
			WalletSyncError::ParseError(format!("Failed to deserialize transaction: {}", e))
		})?;

		Ok(transaction)
	}

	/// Build the record of a transaction seen on the chain server for the first time.
	///
	/// A transaction is stored as confirmed only once it is strictly deeper than the threshold.
	pub async fn record_from_detail(
		&self,
		detail: &TransactionDetail,
		confirmation_threshold: u32,
	) -> Result<TransactionRecord, WalletSyncError> {
		let transaction = self.parse_transaction(&detail.raw_hex)?;
		let tx_id = transaction.compute_txid().to_string();
		if tx_id != detail.tx_id {
			return Err(WalletSyncError::ParseError(format!(
				"Server returned transaction {} when asked for {}",
				tx_id, detail.tx_id
			)));
		}

		let inputs = self.resolve_inputs(&transaction).await?;
		let outputs = self.resolve_outputs(&transaction, |address| self.ledger.is_queried(address));
		let date = detail
			.time
			.and_then(|time| DateTime::from_timestamp(time, 0))
			.unwrap_or_else(epoch);

		debug!(
			"Processed transaction {} ({} inputs, {} outputs, {} confirmations)",
			tx_id,
			inputs.len(),
			outputs.len(),
			detail.confirmations
		);

		Ok(TransactionRecord {
			tx_id,
			raw_hex: detail.raw_hex.clone(),
			date,
			confirmed: detail.confirmations > confirmation_threshold,
			outputs,
			inputs,
		})
	}

	/// Build the record of a transaction this wallet just broadcast.
	///
	/// The record is unconfirmed with an unknown date. Outputs to the change address the next
	/// spend will mint count as the wallet's own.
	pub async fn record_from_broadcast(
		&self,
		transaction: &Transaction,
	) -> Result<TransactionRecord, WalletSyncError> {
		let inputs = self.resolve_inputs(transaction).await?;
		let outputs = self.resolve_outputs(transaction, |address| self.ledger.owns(address));

		Ok(TransactionRecord {
			tx_id: transaction.compute_txid().to_string(),
			raw_hex: bitcoin::consensus::encode::serialize_hex(transaction),
			date: epoch(),
			confirmed: false,
			outputs,
			inputs,
		})
	}

	async fn resolve_inputs(
		&self,
		transaction: &Transaction,
	) -> Result<Vec<InputRecord>, WalletSyncError> {
		let mut inputs = Vec::with_capacity(transaction.input.len());
		for input in &transaction.input {
			let outpoint = input.previous_output;
			if outpoint.is_null() {
				continue;
			}

			let resolved = self.prev_outputs.lookup(&outpoint).await.inspect_err(|e| {
				error!(
					"[RESOLVE_INPUT] Failed to resolve {}:{}: {}",
					outpoint.txid, outpoint.vout, e
				);
			})?;

			let is_user_address = resolved
				.address
				.as_deref()
				.is_some_and(|address| self.ledger.is_queried(address));
			inputs.push(InputRecord {
				prev_tx_id: outpoint.txid.to_string(),
				prev_output_index: outpoint.vout,
				address: resolved.address,
				amount: resolved.amount,
				is_user_address,
			});
		}
		Ok(inputs)
	}

	fn resolve_outputs(
		&self,
		transaction: &Transaction,
		is_own: impl Fn(&str) -> bool,
	) -> Vec<OutputRecord> {
		transaction
			.output
			.iter()
			.map(|output| {
				let address = Address::from_script(&output.script_pubkey, self.network)
					.ok()
					.map(|address| address.to_string());
				OutputRecord {
					is_user_address: address.as_deref().is_some_and(&is_own),
					address,
					amount: output.value,
				}
			})
			.collect()
	}
}
