//! Shared fixtures for unit tests: a deterministic wallet, transaction builders and a scripted
//! chain client.

use crate::config::AddressKind;
use crate::electrum::{ChainClient, ChainClientError, TransactionDetail};
use crate::wallet::keys::{AddressDeriver, Bip32AddressDeriver};
use crate::wallet::{Chain, TransactionRecord, epoch};

use async_trait::async_trait;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness, absolute, transaction,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_LOCK_TIME: AtomicU32 = AtomicU32::new(1);

/// Deterministic regtest wallet plus a foreign key for third-party addresses
pub struct TestWallet {
    deriver: Arc<Bip32AddressDeriver>,
    other: Bip32AddressDeriver,
}

impl TestWallet {
    pub fn new() -> Self {
        Self {
            deriver: Arc::new(
                Bip32AddressDeriver::from_seed(&[7u8; 32], Network::Regtest, AddressKind::Legacy)
                    .unwrap(),
            ),
            other: Bip32AddressDeriver::from_seed(&[9u8; 32], Network::Regtest, AddressKind::Legacy)
                .unwrap(),
        }
    }

    pub fn deriver(&self) -> Arc<dyn AddressDeriver> {
        self.deriver.clone()
    }

    pub fn main(&self, index: u32) -> String {
        self.deriver.derive(Chain::Main, index).unwrap()
    }

    pub fn change(&self, index: u32) -> String {
        self.deriver.derive(Chain::Change, index).unwrap()
    }

    /// An address that does not belong to the wallet
    pub fn external(&self, index: u32) -> String {
        self.other.derive(Chain::Main, index).unwrap()
    }
}

/// Build a transaction spending `inputs` and paying `outputs` (address, sats).
///
/// Without inputs a single null-prevout input is added, like a coinbase. Every call gets a fresh
/// lock time so identical outputs still produce distinct txids.
pub fn build_tx(inputs: &[(Txid, u32)], outputs: &[(&str, u64)]) -> Transaction {
    let prevouts: Vec<OutPoint> = if inputs.is_empty() {
        vec![OutPoint::null()]
    } else {
        inputs
            .iter()
            .map(|(txid, vout)| OutPoint::new(*txid, *vout))
            .collect()
    };

    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::from_consensus(
            NEXT_LOCK_TIME.fetch_add(1, Ordering::Relaxed),
        ),
        input: prevouts
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(address, sats)| TxOut {
                value: Amount::from_sat(*sats),
                script_pubkey: Address::from_str(address)
                    .unwrap()
                    .assume_checked()
                    .script_pubkey(),
            })
            .collect(),
    }
}

pub fn coinbase_tx(outputs: &[(&str, u64)]) -> Transaction {
    build_tx(&[], outputs)
}

/// Minimal record as produced for a freshly broadcast transaction
pub fn broadcast_record(tx_id: &str) -> TransactionRecord {
    TransactionRecord {
        tx_id: tx_id.to_string(),
        raw_hex: String::new(),
        date: epoch(),
        confirmed: false,
        outputs: vec![],
        inputs: vec![],
    }
}

/// How the next broadcasts should fail
#[derive(Clone)]
enum BroadcastFailure {
    Rejected(String),
    Disconnected(String),
    EmptyResponse,
}

/// Scripted chain server
#[derive(Default)]
pub struct MockChainClient {
    histories: Mutex<HashMap<String, Vec<String>>>,
    transactions: Mutex<HashMap<String, TransactionDetail>>,
    failing_histories: Mutex<HashSet<String>>,
    failing_transactions: Mutex<HashSet<String>>,
    history_calls: Mutex<Vec<String>>,
    transaction_calls: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<String>>,
    broadcast_failure: Mutex<Option<BroadcastFailure>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `tx` with the given confirmations and block time, replacing earlier details
    pub fn add_transaction(
        &self,
        tx: &Transaction,
        confirmations: u32,
        time: Option<i64>,
    ) -> TransactionDetail {
        let detail = TransactionDetail {
            tx_id: tx.compute_txid().to_string(),
            raw_hex: bitcoin::consensus::encode::serialize_hex(tx),
            confirmations,
            time,
        };
        self.transactions
            .lock()
            .unwrap()
            .insert(detail.tx_id.clone(), detail.clone());
        detail
    }

    /// Change the confirmations and time reported for an already served transaction
    pub fn set_confirmations(&self, tx_id: &str, confirmations: u32, time: Option<i64>) {
        let mut transactions = self.transactions.lock().unwrap();
        let detail = transactions.get_mut(tx_id).unwrap();
        detail.confirmations = confirmations;
        detail.time = time;
    }

    /// List `tx` in the history of `address`
    pub fn add_history(&self, address: &str, tx: &Transaction) {
        self.histories
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(tx.compute_txid().to_string());
    }

    /// Serve `tx` and list it in the history of every address it pays
    pub fn fund(
        &self,
        tx: &Transaction,
        addresses: &[&str],
        confirmations: u32,
        time: Option<i64>,
    ) -> TransactionDetail {
        for address in addresses {
            self.add_history(address, tx);
        }
        self.add_transaction(tx, confirmations, time)
    }

    pub fn fail_history(&self, address: &str) {
        self.failing_histories
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    pub fn fail_transaction(&self, tx_id: &str) {
        self.failing_transactions
            .lock()
            .unwrap()
            .insert(tx_id.to_string());
    }

    pub fn recover_transaction(&self, tx_id: &str) {
        self.failing_transactions.lock().unwrap().remove(tx_id);
    }

    pub fn reject_broadcasts(&self, reason: &str) {
        *self.broadcast_failure.lock().unwrap() =
            Some(BroadcastFailure::Rejected(reason.to_string()));
    }

    /// Drop the connection on every broadcast
    pub fn disconnect_broadcasts(&self, reason: &str) {
        *self.broadcast_failure.lock().unwrap() =
            Some(BroadcastFailure::Disconnected(reason.to_string()));
    }

    /// Accept broadcasts but answer with a blank transaction id
    pub fn answer_broadcasts_with_blank_id(&self) {
        *self.broadcast_failure.lock().unwrap() = Some(BroadcastFailure::EmptyResponse);
    }

    pub fn history_calls(&self) -> Vec<String> {
        self.history_calls.lock().unwrap().clone()
    }

    pub fn transaction_calls(&self) -> Vec<String> {
        self.transaction_calls.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_history(&self, address: &str) -> Result<Vec<String>, ChainClientError> {
        self.history_calls.lock().unwrap().push(address.to_string());
        if self.failing_histories.lock().unwrap().contains(address) {
            return Err(ChainClientError::Connection("connection reset".into()));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<TransactionDetail, ChainClientError> {
        self.transaction_calls.lock().unwrap().push(tx_id.to_string());
        if self.failing_transactions.lock().unwrap().contains(tx_id) {
            return Err(ChainClientError::Connection("timed out".into()));
        }
        self.transactions
            .lock()
            .unwrap()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| ChainClientError::Connection(format!("unknown transaction {}", tx_id)))
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String, ChainClientError> {
        let failure = self.broadcast_failure.lock().unwrap().clone();
        match &failure {
            Some(BroadcastFailure::Rejected(reason)) => {
                return Err(ChainClientError::Rejected(reason.clone()));
            }
            Some(BroadcastFailure::Disconnected(reason)) => {
                return Err(ChainClientError::Connection(reason.clone()));
            }
            Some(BroadcastFailure::EmptyResponse) | None => {}
        }
        let bytes = hex::decode(raw_hex).map_err(|e| ChainClientError::Decode(e.to_string()))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| ChainClientError::Decode(e.to_string()))?;
        self.broadcasts.lock().unwrap().push(raw_hex.to_string());
        if matches!(failure, Some(BroadcastFailure::EmptyResponse)) {
            return Ok("  ".to_string());
        }
        Ok(tx.compute_txid().to_string())
    }
}
