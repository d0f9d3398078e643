use super::types::*;

use async_trait::async_trait;
use bitcoin::{Address, Network, OutPoint, Transaction};
use std::sync::Arc;
use tracing::error;

/// Remote chain-indexing capability consumed by the synchronizer and the broadcast service
#[async_trait]
pub trait ChainClient: Send + Sync {
	/// Ids of every transaction touching `address`, mempool included.
	async fn get_history(&self, address: &str) -> Result<Vec<String>, ChainClientError>;

	/// Raw transaction, confirmation count and block time for `tx_id`.
	async fn get_transaction(&self, tx_id: &str) -> Result<TransactionDetail, ChainClientError>;

	/// Submit a raw transaction, returning the id the server accepted it under.
	async fn broadcast(&self, raw_hex: &str) -> Result<String, ChainClientError>;
}

/// Resolves the output a transaction input spends.
///
/// The transaction log does not keep ancestor transactions, so the address and amount of a spent
/// output have to be looked up on demand.
#[async_trait]
pub trait PrevOutputLookup: Send + Sync {
	async fn lookup(&self, outpoint: &OutPoint) -> Result<ResolvedOutput, ChainClientError>;
}

/// `PrevOutputLookup` that fetches the parent transaction through a `ChainClient`
#[derive(Clone)]
pub struct ChainPrevOutputLookup {
	client: Arc<dyn ChainClient>,
	network: Network,
}

impl ChainPrevOutputLookup {
	pub fn new(client: Arc<dyn ChainClient>, network: Network) -> Self {
		Self { client, network }
	}
}

#[async_trait]
impl PrevOutputLookup for ChainPrevOutputLookup {
	async fn lookup(&self, outpoint: &OutPoint) -> Result<ResolvedOutput, ChainClientError> {
		let detail = self
			.client
			.get_transaction(&outpoint.txid.to_string())
			.await?;

		let bytes = hex::decode(&detail.raw_hex).map_err(|e| {
			error!("[PREV_OUTPUT] Failed to decode hex of {}: {}", outpoint.txid, e);
			ChainClientError::Decode(format!("Failed to decode hex: {}", e))
		})?;
		let parent: Transaction = bitcoin::consensus::deserialize(&bytes).map_err(|e| {
			error!("[PREV_OUTPUT] Failed to deserialize {}: {}", outpoint.txid, e);
			ChainClientError::Decode(format!("Failed to deserialize transaction: {}", e))
		})?;

		let output = parent.output.get(outpoint.vout as usize).ok_or_else(|| {
			ChainClientError::Decode(format!(
				"Transaction {} has no output {}",
				outpoint.txid, outpoint.vout
			))
		})?;

		Ok(ResolvedOutput {
			address: Address::from_script(&output.script_pubkey, self.network)
				.ok()
				.map(|address| address.to_string()),
			amount: output.value,
		})
	}
}
