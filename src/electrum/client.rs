//!
//! Electrum protocol client for the wallet's chain queries.
//!
//! `electrum_client::Client` is blocking, so every call is moved onto the blocking thread pool
//! with `spawn_blocking`. The connection itself is established with exponential backoff because
//! public Electrum servers routinely refuse the first attempt under load.

use super::ports::ChainClient;
use super::types::*;
use crate::config::NodeConfig;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, future::retry};
use bitcoin::{Address, Network};
use electrum_client::{Client, ElectrumApi, Param};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Electrum server client
#[derive(Clone)]
pub struct ElectrumChainClient {
	/// The underlying blocking protocol client.
	client: Arc<Client>,
	/// Network addresses are validated against.
	network: Network,
}

impl ElectrumChainClient {
	/// Connect to the server described by `config`.
	///
	/// # Returns
	/// A connected client, or the last connection error once the backoff budget is exhausted.
	pub async fn connect(config: &NodeConfig) -> Result<Self, ChainClientError> {
		let url = config.electrum_url();
		info!("Connecting to Electrum server at {}", url);

		let backoff = ExponentialBackoff {
			max_elapsed_time: Some(Duration::from_secs(30)),
			..ExponentialBackoff::default()
		};

		let client = retry(backoff, || {
			let url = url.clone();
			async move {
				tokio::task::spawn_blocking(move || Client::new(&url))
					.await
					.map_err(|e| backoff::Error::permanent(ChainClientError::Task(e.to_string())))?
					.map_err(|e| {
						warn!("Electrum connection attempt failed: {}", e);
						backoff::Error::transient(ChainClientError::from(e))
					})
			}
		})
		.await?;

		info!("Connected to Electrum server");
		Ok(Self {
			client: Arc::new(client),
			network: config.network.into(),
		})
	}

	async fn call<T, F>(&self, f: F) -> Result<T, ChainClientError>
	where
		T: Send + 'static,
		F: FnOnce(&Client) -> Result<T, electrum_client::Error> + Send + 'static,
	{
		let client = self.client.clone();
		tokio::task::spawn_blocking(move || f(client.as_ref()))
			.await
			.map_err(|e| ChainClientError::Task(e.to_string()))?
			.map_err(ChainClientError::from)
	}
}

#[async_trait]
impl ChainClient for ElectrumChainClient {
	async fn get_history(&self, address: &str) -> Result<Vec<String>, ChainClientError> {
		let script = Address::from_str(address)
			.and_then(|address| address.require_network(self.network))
			.map_err(|e| ChainClientError::Decode(format!("Invalid address {}: {}", address, e)))?
			.script_pubkey();

		let history = self
			.call(move |client| client.script_get_history(&script))
			.await?;

		debug!("Address {} has {} history entries", address, history.len());
		Ok(history
			.into_iter()
			.map(|entry| entry.tx_hash.to_string())
			.collect())
	}

	async fn get_transaction(&self, tx_id: &str) -> Result<TransactionDetail, ChainClientError> {
		let params = vec![Param::String(tx_id.to_string()), Param::Bool(true)];
		let value = self
			.call(move |client| client.raw_call("blockchain.transaction.get", params))
			.await?;

		let verbose: VerboseTransaction = serde_json::from_value(value)?;
		Ok(verbose.into())
	}

	async fn broadcast(&self, raw_hex: &str) -> Result<String, ChainClientError> {
		let bytes = hex::decode(raw_hex)
			.map_err(|e| ChainClientError::Decode(format!("Failed to decode hex: {}", e)))?;

		let txid = self
			.call(move |client| client.transaction_broadcast_raw(&bytes))
			.await?;

		info!("Electrum server accepted transaction {}", txid);
		Ok(txid.to_string())
	}
}
