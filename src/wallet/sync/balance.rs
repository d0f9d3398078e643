//! Balance ledger: the wallet's UTXO set and aggregate balances.
//!
//! The ledger is a materialized view over the transaction log. It is rebuilt once from the log at
//! startup and afterwards maintained incrementally from two facts:
//! - `AddressesFetched`: outputs paying the address become UTXOs unless a known transaction
//!   spends them, in which case a previously recorded UTXO is removed
//! - `TransactionBroadcast`: the wallet's outputs of the new transaction are added and the UTXOs
//!   its inputs spend are removed
//!
//! UTXOs are identified per address by transaction id only, so a second output of the same
//! transaction to the same address is not tracked separately.

use crate::wallet::sync::events::{
    AddressesFetched, BalanceUpdated, EventBus, EventBusExt, EventHandler, SubscriptionToken,
    TransactionBroadcast,
};
use crate::wallet::sync::transaction_log::TransactionLog;
use crate::wallet::{TransactionRecord, WalletSyncError};

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, SignedAmount, Transaction, TxOut, Txid};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// An unspent output paying one of the wallet's addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRecord {
    pub tx_id: String,
    pub output_index: u32,
    pub address: String,
    pub amount: Amount,
    /// Confirmation state of the owning transaction
    pub confirmed: bool,
    pub raw_hex: String,
}

/// A UTXO resolved into the pieces a transaction builder needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableCoin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub confirmed: bool,
}

fn signed(amount: Amount) -> SignedAmount {
    SignedAmount::from_sat(amount.to_sat() as i64)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BalanceState {
    utxos_by_address: HashMap<String, Vec<UtxoRecord>>,
    confirmed: SignedAmount,
    unconfirmed: SignedAmount,
}

impl BalanceState {
    /// Replay the full log. An output counts iff it is the wallet's own and nothing spends it.
    fn from_log(records: &[TransactionRecord], is_spent: impl Fn(&str, u32) -> bool) -> Self {
        let mut state = Self::default();
        for record in records {
            for (index, output) in record.outputs.iter().enumerate() {
                if !output.is_user_address {
                    continue;
                }
                let Some(address) = output.address.as_deref() else {
                    continue;
                };
                state.apply_output(address, record, index, &is_spent);
            }
        }
        state
    }

    fn apply_fetched(
        &mut self,
        address: &str,
        transactions: &[TransactionRecord],
        is_spent: impl Fn(&str, u32) -> bool,
    ) {
        for record in transactions {
            if let Some(index) = record.output_index_for(address) {
                self.apply_output(address, record, index, &is_spent);
            }
        }
    }

    fn apply_output(
        &mut self,
        address: &str,
        record: &TransactionRecord,
        index: usize,
        is_spent: &impl Fn(&str, u32) -> bool,
    ) {
        let output_index = index as u32;
        if is_spent(&record.tx_id, output_index) {
            self.remove(address, &record.tx_id);
            return;
        }

        let utxos = self.utxos_by_address.entry(address.to_string()).or_default();
        if let Some(existing) = utxos.iter_mut().find(|utxo| utxo.tx_id == record.tx_id) {
            if record.confirmed && !existing.confirmed {
                existing.confirmed = true;
                let amount = signed(existing.amount);
                self.unconfirmed -= amount;
                self.confirmed += amount;
            }
            return;
        }

        let amount = record.outputs[index].amount;
        utxos.push(UtxoRecord {
            tx_id: record.tx_id.clone(),
            output_index,
            address: address.to_string(),
            amount,
            confirmed: record.confirmed,
            raw_hex: record.raw_hex.clone(),
        });
        self.add_to_total(record.confirmed, signed(amount));
    }

    /// Drop every UTXO of `tx_id` at `address`, subtracting each from its own total.
    fn remove(&mut self, address: &str, tx_id: &str) {
        let Some(utxos) = self.utxos_by_address.get_mut(address) else {
            return;
        };
        let mut removed = Vec::new();
        utxos.retain(|utxo| {
            if utxo.tx_id == tx_id {
                removed.push((utxo.confirmed, signed(utxo.amount)));
                false
            } else {
                true
            }
        });
        for (confirmed, amount) in removed {
            self.add_to_total(confirmed, -amount);
        }
    }

    /// Totals move by the broadcast transaction's own confirmation state, for inputs as well.
    fn apply_broadcast(&mut self, record: &TransactionRecord) {
        for (index, output) in record.outputs.iter().enumerate() {
            if !output.is_user_address {
                continue;
            }
            let Some(address) = output.address.as_deref() else {
                continue;
            };
            self.utxos_by_address
                .entry(address.to_string())
                .or_default()
                .push(UtxoRecord {
                    tx_id: record.tx_id.clone(),
                    output_index: index as u32,
                    address: address.to_string(),
                    amount: output.amount,
                    confirmed: record.confirmed,
                    raw_hex: record.raw_hex.clone(),
                });
            self.add_to_total(record.confirmed, signed(output.amount));
        }

        // every input is charged, even one whose UTXO is not tracked
        for input in &record.inputs {
            match input
                .address
                .as_deref()
                .and_then(|address| self.utxos_by_address.get_mut(address))
            {
                Some(utxos) => utxos.retain(|utxo| utxo.tx_id != input.prev_tx_id),
                None => warn!(
                    "Broadcast {} spends {}:{} from an untracked address",
                    record.tx_id, input.prev_tx_id, input.prev_output_index
                ),
            }
            self.add_to_total(record.confirmed, -signed(input.amount));
        }
    }

    fn add_to_total(&mut self, confirmed: bool, amount: SignedAmount) {
        if confirmed {
            self.confirmed += amount;
        } else {
            self.unconfirmed += amount;
        }
    }

    fn balance_updated(&self) -> BalanceUpdated {
        BalanceUpdated {
            confirmed: self.confirmed,
            unconfirmed: self.unconfirmed,
        }
    }
}

/// Maintains the UTXO set and the confirmed and unconfirmed totals.
pub struct BalanceLedger {
    log: Arc<TransactionLog>,
    bus: Arc<dyn EventBus>,
    state: RwLock<BalanceState>,
}

impl BalanceLedger {
    /// Create a ledger by replaying every record currently in `log`.
    pub fn new(log: Arc<TransactionLog>, bus: Arc<dyn EventBus>) -> Self {
        let state = BalanceState::from_log(&log.snapshot(), |tx_id, vout| {
            log.is_output_spent(tx_id, vout)
        });
        info!(
            "Restored {} UTXOs (confirmed {}, unconfirmed {})",
            state.utxos_by_address.values().map(Vec::len).sum::<usize>(),
            state.confirmed,
            state.unconfirmed
        );

        Self {
            log,
            bus,
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BalanceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BalanceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the ledger's handlers on `bus`.
    pub fn subscribe(self: &Arc<Self>, bus: &dyn EventBus) -> Vec<SubscriptionToken> {
        vec![
            bus.subscribe::<AddressesFetched, _>(self.clone()),
            bus.subscribe::<TransactionBroadcast, _>(self.clone()),
        ]
    }

    /// Copy of the UTXO lists keyed by address
    pub fn utxos_by_address(&self) -> HashMap<String, Vec<UtxoRecord>> {
        self.read().utxos_by_address.clone()
    }

    pub fn utxos(&self) -> Vec<UtxoRecord> {
        self.read()
            .utxos_by_address
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn confirmed_balance(&self) -> SignedAmount {
        self.read().confirmed
    }

    pub fn unconfirmed_balance(&self) -> SignedAmount {
        self.read().unconfirmed
    }

    /// Resolve every UTXO against its stored raw transaction.
    pub fn spendable_coins(&self) -> Result<Vec<SpendableCoin>, WalletSyncError> {
        self.utxos()
            .into_iter()
            .map(|utxo| {
                let bytes = hex::decode(&utxo.raw_hex).map_err(|e| {
                    WalletSyncError::ParseError(format!(
                        "UTXO {}:{} has invalid hex: {}",
                        utxo.tx_id, utxo.output_index, e
                    ))
                })?;
                let transaction: Transaction =
                    bitcoin::consensus::deserialize(&bytes).map_err(|e| {
                        WalletSyncError::ParseError(format!(
                            "UTXO {}:{} has an invalid transaction: {}",
                            utxo.tx_id, utxo.output_index, e
                        ))
                    })?;
                let txid = Txid::from_str(&utxo.tx_id)
                    .map_err(|e| WalletSyncError::ParseError(e.to_string()))?;
                let txout = transaction
                    .output
                    .get(utxo.output_index as usize)
                    .cloned()
                    .ok_or_else(|| {
                        WalletSyncError::ParseError(format!(
                            "UTXO {}:{} is out of range",
                            utxo.tx_id, utxo.output_index
                        ))
                    })?;

                Ok(SpendableCoin {
                    outpoint: OutPoint::new(txid, utxo.output_index),
                    txout,
                    confirmed: utxo.confirmed,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler<AddressesFetched> for BalanceLedger {
    async fn handle(&self, event: &AddressesFetched) -> Result<(), WalletSyncError> {
        let update = {
            let mut state = self.write();
            state.apply_fetched(&event.address, &event.transactions, |tx_id, vout| {
                self.log.is_output_spent(tx_id, vout)
            });
            state.balance_updated()
        };
        debug!(
            "Balance after {}: confirmed {}, unconfirmed {}",
            event.address, update.confirmed, update.unconfirmed
        );
        self.bus.publish(update);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BalanceLedger"
    }
}

#[async_trait]
impl EventHandler<TransactionBroadcast> for BalanceLedger {
    async fn handle(&self, event: &TransactionBroadcast) -> Result<(), WalletSyncError> {
        let update = {
            let mut state = self.write();
            state.apply_broadcast(&event.transaction);
            state.balance_updated()
        };
        self.bus.publish(update);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BalanceLedger"
    }
}
