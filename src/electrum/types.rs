//! Types for chain server integration

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

/// Transaction details as reported by the chain server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDetail {
    /// The transaction id (hex, display byte order).
    pub tx_id: String,
    /// The consensus-encoded transaction as hex.
    pub raw_hex: String,
    /// Number of confirmations, 0 while the transaction sits in the mempool.
    pub confirmations: u32,
    /// Block time as a unix timestamp, if the transaction is mined.
    pub time: Option<i64>,
}

/// Verbose `blockchain.transaction.get` response.
///
/// Only the fields the wallet reads are modelled. Unconfirmed transactions omit `confirmations`
/// and `time`, so both default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseTransaction {
    pub txid: String,
    pub hex: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, rename = "time")]
    pub block_time: Option<i64>,
}

impl From<VerboseTransaction> for TransactionDetail {
    fn from(tx: VerboseTransaction) -> Self {
        Self {
            tx_id: tx.txid,
            raw_hex: tx.hex,
            confirmations: tx.confirmations,
            time: tx.block_time.filter(|time| *time > 0),
        }
    }
}

/// An output referenced by a transaction input, resolved from its parent transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub address: Option<String>,
    pub amount: Amount,
}

/// Error types for chain server operations
#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<electrum_client::Error> for ChainClientError {
    fn from(err: electrum_client::Error) -> Self {
        match err {
            electrum_client::Error::Protocol(value) => {
                ChainClientError::Rejected(value.to_string())
            }
            electrum_client::Error::IOError(e) => ChainClientError::Connection(e.to_string()),
            other => ChainClientError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChainClientError {
    fn from(err: serde_json::Error) -> Self {
        ChainClientError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfirmed_verbose_response_defaults() {
        let json = serde_json::json!({
            "txid": "ab",
            "hex": "00",
        });
        let detail: TransactionDetail = serde_json::from_value::<VerboseTransaction>(json)
            .unwrap()
            .into();

        assert_eq!(detail.confirmations, 0);
        assert_eq!(detail.time, None);
    }

    #[test]
    fn zero_block_time_is_treated_as_unknown() {
        let json = serde_json::json!({
            "txid": "ab",
            "hex": "00",
            "confirmations": 3,
            "time": 0,
        });
        let detail: TransactionDetail = serde_json::from_value::<VerboseTransaction>(json)
            .unwrap()
            .into();

        assert_eq!(detail.confirmations, 3);
        assert_eq!(detail.time, None);
    }
}
