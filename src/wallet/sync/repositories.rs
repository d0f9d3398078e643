use crate::wallet::{Chain, TransactionRecord, WalletSyncError};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Repository for the transaction log
#[async_trait::async_trait]
pub trait TransactionRepository: Send + Sync {
	async fn save(&self, transactions: &[TransactionRecord]) -> Result<(), WalletSyncError>;
	async fn load(&self) -> Result<Vec<TransactionRecord>, WalletSyncError>;
}

/// Repository for the last used address index of each chain
#[async_trait::async_trait]
pub trait AddressIndexRepository: Send + Sync {
	/// Last used index of `chain`, `None` if no address was ever used
	async fn last_index(&self, chain: Chain) -> Result<Option<u32>, WalletSyncError>;
	async fn set_last_index(&self, chain: Chain, index: u32) -> Result<(), WalletSyncError>;
}

/// Persisted last used indices of both chains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressIndices {
	pub main: Option<u32>,
	pub change: Option<u32>,
}

impl AddressIndices {
	pub fn get(&self, chain: Chain) -> Option<u32> {
		match chain {
			Chain::Main => self.main,
			Chain::Change => self.change,
		}
	}

	pub fn set(&mut self, chain: Chain, index: u32) {
		match chain {
			Chain::Main => self.main = Some(index),
			Chain::Change => self.change = Some(index),
		}
	}
}

/// Write `bytes` to `path` through a sibling temp file so readers never see a partial file
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WalletSyncError> {
	let tmp = path.with_extension("tmp");
	tokio::fs::write(&tmp, bytes).await.map_err(|e| {
		WalletSyncError::Persistence(format!("Failed to write {:?}: {}", tmp, e))
	})?;
	tokio::fs::rename(&tmp, path).await.map_err(|e| {
		WalletSyncError::Persistence(format!("Failed to move {:?} into place: {}", tmp, e))
	})?;
	Ok(())
}

async fn ensure_dir(dir: &Path) -> Result<(), WalletSyncError> {
	tokio::fs::create_dir_all(dir).await.map_err(|e| {
		WalletSyncError::Persistence(format!("Failed to create data directory {:?}: {}", dir, e))
	})
}

/// File-based implementation of TransactionRepository
pub struct FileTransactionRepository {
	data_dir: PathBuf,
}

impl FileTransactionRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_log_filename(&self) -> PathBuf {
		self.data_dir.join("transactions.bin")
	}

	fn get_metadata_filename(&self) -> PathBuf {
		self.data_dir.join("transactions.meta.json")
	}
}

#[async_trait::async_trait]
impl TransactionRepository for FileTransactionRepository {
	async fn save(&self, transactions: &[TransactionRecord]) -> Result<(), WalletSyncError> {
		ensure_dir(&self.data_dir).await?;

		// Serialize transaction log
		let log_bytes = bincode::serialize(transactions).map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to serialize transaction log: {}", e))
		})?;

		// Write log file
		let filename = self.get_log_filename();
		write_atomic(&filename, &log_bytes).await?;

		// Create metadata
		let metadata = serde_json::json!({
			"count": transactions.len(),
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});
		let metadata_bytes = serde_json::to_vec_pretty(&metadata).map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to serialize log metadata: {}", e))
		})?;
		write_atomic(&self.get_metadata_filename(), &metadata_bytes).await?;

		info!(
			"Saved {} transactions to {:?}",
			transactions.len(),
			filename
		);
		Ok(())
	}

	async fn load(&self) -> Result<Vec<TransactionRecord>, WalletSyncError> {
		let filename = self.get_log_filename();

		// Check if file exists
		if !tokio::fs::try_exists(&filename).await.unwrap_or(false) {
			debug!("No transaction log at {:?}", filename);
			return Ok(Vec::new());
		}

		let log_bytes = tokio::fs::read(&filename).await.map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to read transaction log: {}", e))
		})?;

		let transactions: Vec<TransactionRecord> =
			bincode::deserialize(&log_bytes).map_err(|e| {
				WalletSyncError::Persistence(format!(
					"Failed to deserialize transaction log: {}",
					e
				))
			})?;

		info!(
			"Loaded {} transactions from {:?}",
			transactions.len(),
			filename
		);
		Ok(transactions)
	}
}

/// File-based implementation of AddressIndexRepository
pub struct FileAddressIndexRepository {
	data_dir: PathBuf,
	/// Serializes read-modify-write cycles on the index file
	write_lock: tokio::sync::Mutex<()>,
}

impl FileAddressIndexRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			data_dir,
			write_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn get_indices_filename(&self) -> PathBuf {
		self.data_dir.join("address_indices.json")
	}

	async fn read_indices(&self) -> Result<AddressIndices, WalletSyncError> {
		let filename = self.get_indices_filename();
		if !tokio::fs::try_exists(&filename).await.unwrap_or(false) {
			return Ok(AddressIndices::default());
		}

		let content = tokio::fs::read_to_string(&filename).await.map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to read address indices: {}", e))
		})?;
		serde_json::from_str(&content).map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to parse address indices: {}", e))
		})
	}
}

#[async_trait::async_trait]
impl AddressIndexRepository for FileAddressIndexRepository {
	async fn last_index(&self, chain: Chain) -> Result<Option<u32>, WalletSyncError> {
		Ok(self.read_indices().await?.get(chain))
	}

	async fn set_last_index(&self, chain: Chain, index: u32) -> Result<(), WalletSyncError> {
		let _guard = self.write_lock.lock().await;
		ensure_dir(&self.data_dir).await?;

		let mut indices = self.read_indices().await?;
		indices.set(chain, index);

		let content = serde_json::to_vec_pretty(&indices).map_err(|e| {
			WalletSyncError::Persistence(format!("Failed to serialize address indices: {}", e))
		})?;
		write_atomic(&self.get_indices_filename(), &content).await?;

		debug!("Stored last {} address index {}", chain, index);
		Ok(())
	}
}

/// In-memory implementation of TransactionRepository
#[derive(Default)]
pub struct InMemoryTransactionRepository {
	transactions: Mutex<Vec<TransactionRecord>>,
}

impl InMemoryTransactionRepository {
	pub fn new(transactions: Vec<TransactionRecord>) -> Self {
		Self {
			transactions: Mutex::new(transactions),
		}
	}
}

#[async_trait::async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
	async fn save(&self, transactions: &[TransactionRecord]) -> Result<(), WalletSyncError> {
		*self.transactions.lock().unwrap_or_else(|e| e.into_inner()) = transactions.to_vec();
		Ok(())
	}

	async fn load(&self) -> Result<Vec<TransactionRecord>, WalletSyncError> {
		Ok(self
			.transactions
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone())
	}
}

/// In-memory implementation of AddressIndexRepository
#[derive(Default)]
pub struct InMemoryAddressIndexRepository {
	indices: Mutex<AddressIndices>,
}

impl InMemoryAddressIndexRepository {
	pub fn new(indices: AddressIndices) -> Self {
		Self {
			indices: Mutex::new(indices),
		}
	}
}

#[async_trait::async_trait]
impl AddressIndexRepository for InMemoryAddressIndexRepository {
	async fn last_index(&self, chain: Chain) -> Result<Option<u32>, WalletSyncError> {
		Ok(self
			.indices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(chain))
	}

	async fn set_last_index(&self, chain: Chain, index: u32) -> Result<(), WalletSyncError> {
		self.indices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.set(chain, index);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::{InputRecord, OutputRecord, epoch};
	use bitcoin::Amount;

	fn record(tx_id: &str) -> TransactionRecord {
		TransactionRecord {
			tx_id: tx_id.to_string(),
			raw_hex: "00".to_string(),
			date: epoch(),
			confirmed: true,
			outputs: vec![OutputRecord {
				address: Some("addr".to_string()),
				amount: Amount::from_sat(1_500),
				is_user_address: true,
			}],
			inputs: vec![InputRecord {
				prev_tx_id: "prev".to_string(),
				prev_output_index: 2,
				address: None,
				amount: Amount::from_sat(2_000),
				is_user_address: false,
			}],
		}
	}

	#[tokio::test]
	async fn transaction_log_survives_a_file_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileTransactionRepository::new(dir.path().join("nested"));

		assert!(repo.load().await.unwrap().is_empty());

		let transactions = vec![record("a"), record("b")];
		repo.save(&transactions).await.unwrap();

		assert_eq!(repo.load().await.unwrap(), transactions);
		let meta =
			std::fs::read_to_string(dir.path().join("nested/transactions.meta.json")).unwrap();
		let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
		assert_eq!(meta["count"], 2);
		assert!(!dir.path().join("nested/transactions.tmp").exists());
	}

	#[tokio::test]
	async fn corrupt_log_is_a_persistence_error() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("transactions.bin"), [0xff, 0xff, 0xff]).unwrap();
		let repo = FileTransactionRepository::new(dir.path().to_path_buf());

		assert!(matches!(
			repo.load().await,
			Err(WalletSyncError::Persistence(_))
		));
	}

	#[tokio::test]
	async fn address_indices_default_to_none_and_are_kept_per_chain() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileAddressIndexRepository::new(dir.path().to_path_buf());

		assert_eq!(repo.last_index(Chain::Main).await.unwrap(), None);

		repo.set_last_index(Chain::Main, 4).await.unwrap();
		repo.set_last_index(Chain::Change, 1).await.unwrap();
		repo.set_last_index(Chain::Change, 2).await.unwrap();

		let reopened = FileAddressIndexRepository::new(dir.path().to_path_buf());
		assert_eq!(reopened.last_index(Chain::Main).await.unwrap(), Some(4));
		assert_eq!(reopened.last_index(Chain::Change).await.unwrap(), Some(2));
	}
}
