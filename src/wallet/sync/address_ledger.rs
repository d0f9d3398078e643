//! Address ledger for the wallet's two derivation chains.
//!
//! The ledger owns every derived address, remembers which addresses were ever sent to the chain
//! server, and keeps the monotonic last used index of each chain. Indices are only moved forward
//! from the event path (`AddressRangeExtended` and `TransactionBroadcast`), and every change is
//! persisted immediately.

use crate::wallet::keys::AddressDeriver;
use crate::wallet::sync::events::{
    AddressRangeExtended, EventBus, EventBusExt, EventHandler, SubscriptionToken,
    TransactionBroadcast,
};
use crate::wallet::sync::state_persistence::StatePersistenceService;
use crate::wallet::{Chain, WalletSyncError};

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct ChainAddresses {
    /// Addresses at indices `0..=last_index`, in index order
    derived: Vec<String>,
    /// Addresses queried at least once, in query order
    queried: Vec<String>,
    queried_set: HashSet<String>,
    last_index: Option<u32>,
    current: Option<String>,
}

impl ChainAddresses {
    fn mark_queried(&mut self, address: String) {
        if self.queried_set.insert(address.clone()) {
            self.queried.push(address);
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    main: ChainAddresses,
    change: ChainAddresses,
}

impl LedgerState {
    fn chain(&self, chain: Chain) -> &ChainAddresses {
        match chain {
            Chain::Main => &self.main,
            Chain::Change => &self.change,
        }
    }

    fn chain_mut(&mut self, chain: Chain) -> &mut ChainAddresses {
        match chain {
            Chain::Main => &mut self.main,
            Chain::Change => &mut self.change,
        }
    }
}

/// Owner of the derived address sequences and their last used indices
pub struct AddressLedger {
    deriver: Arc<dyn AddressDeriver>,
    persistence: Arc<StatePersistenceService>,
    state: RwLock<LedgerState>,
    /// Serializes index extensions so check, derive, apply and persist happen as one step
    extend_lock: tokio::sync::Mutex<()>,
}

impl AddressLedger {
    /// Create a ledger with no used addresses.
    pub fn new(
        deriver: Arc<dyn AddressDeriver>,
        persistence: Arc<StatePersistenceService>,
    ) -> Self {
        Self {
            deriver,
            persistence,
            state: RwLock::new(LedgerState::default()),
            extend_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a ledger from the persisted indices.
    ///
    /// Every address up to each stored index is derived again and marked as queried before any
    /// network activity happens, so ownership checks work on a cold start.
    pub async fn load(
        deriver: Arc<dyn AddressDeriver>,
        persistence: Arc<StatePersistenceService>,
    ) -> Result<Self, WalletSyncError> {
        let ledger = Self::new(deriver, persistence);

        for chain in Chain::ALL {
            let Some(last) = ledger.persistence.last_index(chain).await? else {
                continue;
            };
            let addresses = (0..=last)
                .map(|index| ledger.deriver.derive(chain, index))
                .collect::<Result<Vec<_>, _>>()?;

            let mut state = ledger.write();
            let entry = state.chain_mut(chain);
            for address in &addresses {
                entry.mark_queried(address.clone());
            }
            entry.current = addresses.last().cloned();
            entry.derived = addresses;
            entry.last_index = Some(last);
            info!("Restored {} {} addresses", last + 1, chain);
        }

        Ok(ledger)
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the ledger's handlers on `bus`.
    pub fn subscribe(self: &Arc<Self>, bus: &dyn EventBus) -> Vec<SubscriptionToken> {
        vec![
            bus.subscribe::<AddressRangeExtended, _>(self.clone()),
            bus.subscribe::<TransactionBroadcast, _>(self.clone()),
        ]
    }

    /// Address at `index` on `chain`.
    pub fn derive_at(&self, chain: Chain, index: u32) -> Result<String, WalletSyncError> {
        self.deriver.derive(chain, index)
    }

    /// Address right after the last used one, without recording it as used.
    pub fn derive_next(&self, chain: Chain) -> Result<String, WalletSyncError> {
        self.deriver.derive(chain, next_index(self.last_index(chain)))
    }

    /// Move the last used index of `chain` forward to `new_last_index`.
    ///
    /// Every missing address up to `new_last_index` is derived, the newest becomes the chain's
    /// current address, and the index is persisted. Asking for the current index is a no-op;
    /// asking for a lower one is an ordering error.
    pub async fn extend_to(
        &self,
        chain: Chain,
        new_last_index: u32,
    ) -> Result<(), WalletSyncError> {
        let _guard = self.extend_lock.lock().await;

        let last = self.last_index(chain);
        match last {
            Some(last) if new_last_index < last => {
                return Err(WalletSyncError::IndexOrdering {
                    chain,
                    requested: new_last_index,
                    last: Some(last),
                });
            }
            Some(last) if new_last_index == last => return Ok(()),
            _ => {}
        }

        let addresses = (next_index(last)..=new_last_index)
            .map(|index| self.deriver.derive(chain, index))
            .collect::<Result<Vec<_>, _>>()?;
        let added = addresses.len();

        {
            let mut state = self.write();
            let entry = state.chain_mut(chain);
            entry.current = addresses.last().cloned();
            entry.derived.extend(addresses);
            entry.last_index = Some(new_last_index);
        }

        self.persistence.set_last_index(chain, new_last_index).await?;
        info!(
            "Extended {} chain to index {} ({} new addresses)",
            chain, new_last_index, added
        );
        Ok(())
    }

    /// Mint the next change address after a spend and persist its index.
    pub async fn extend_change_after_broadcast(&self) -> Result<(), WalletSyncError> {
        let next = next_index(self.last_index(Chain::Change));
        self.extend_to(Chain::Change, next).await
    }

    /// Record that the address at `index` on `chain` was sent to the chain server.
    pub fn mark_queried(&self, chain: Chain, index: u32) -> Result<(), WalletSyncError> {
        let address = self.deriver.derive(chain, index)?;
        self.write().chain_mut(chain).mark_queried(address);
        Ok(())
    }

    /// Whether `address` was queried on either chain.
    pub fn is_queried(&self, address: &str) -> bool {
        let state = self.read();
        state.main.queried_set.contains(address) || state.change.queried_set.contains(address)
    }

    /// Whether `address` belongs to the wallet as far as the ledger knows: queried, derived, or
    /// the change address the next spend will use.
    pub fn owns(&self, address: &str) -> bool {
        if self.is_queried(address) {
            return true;
        }
        {
            let state = self.read();
            if Chain::ALL
                .iter()
                .any(|chain| state.chain(*chain).derived.iter().any(|a| a == address))
            {
                return true;
            }
        }
        match self.derive_next(Chain::Change) {
            Ok(next_change) => next_change == address,
            Err(e) => {
                debug!("Could not derive next change address: {}", e);
                false
            }
        }
    }

    pub fn last_index(&self, chain: Chain) -> Option<u32> {
        self.read().chain(chain).last_index
    }

    /// Most recently derived address of `chain`
    pub fn current_address(&self, chain: Chain) -> Option<String> {
        self.read().chain(chain).current.clone()
    }

    pub fn derived_addresses(&self, chain: Chain) -> Vec<String> {
        self.read().chain(chain).derived.clone()
    }

    pub fn queried_addresses(&self, chain: Chain) -> Vec<String> {
        self.read().chain(chain).queried.clone()
    }
}

fn next_index(last: Option<u32>) -> u32 {
    last.map_or(0, |last| last + 1)
}

#[async_trait]
impl EventHandler<AddressRangeExtended> for AddressLedger {
    async fn handle(&self, event: &AddressRangeExtended) -> Result<(), WalletSyncError> {
        self.extend_to(event.chain, event.new_last_index)
            .await
            .inspect_err(|e| error!("[EXTEND_RANGE] {}", e))
    }

    fn name(&self) -> &'static str {
        "AddressLedger"
    }
}

#[async_trait]
impl EventHandler<TransactionBroadcast> for AddressLedger {
    async fn handle(&self, event: &TransactionBroadcast) -> Result<(), WalletSyncError> {
        debug!(
            "Minting change address after broadcast of {}",
            event.transaction.tx_id
        );
        self.extend_change_after_broadcast().await
    }

    fn name(&self) -> &'static str {
        "AddressLedger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestWallet, broadcast_record};
    use crate::wallet::sync::events::{DeterministicEventBus, EventBusExt};

    fn ledger(wallet: &TestWallet) -> (AddressLedger, Arc<StatePersistenceService>) {
        let persistence = Arc::new(StatePersistenceService::in_memory());
        (
            AddressLedger::new(wallet.deriver(), persistence.clone()),
            persistence,
        )
    }

    #[tokio::test]
    async fn moving_an_index_backwards_is_an_ordering_error() {
        let wallet = TestWallet::new();
        let (ledger, _) = ledger(&wallet);

        ledger.extend_to(Chain::Main, 5).await.unwrap();
        let err = ledger.extend_to(Chain::Main, 3).await.unwrap_err();

        assert!(matches!(
            err,
            WalletSyncError::IndexOrdering {
                chain: Chain::Main,
                requested: 3,
                last: Some(5)
            }
        ));
        assert_eq!(ledger.last_index(Chain::Main), Some(5));
    }

    #[tokio::test]
    async fn extending_derives_exactly_the_missing_addresses() {
        let wallet = TestWallet::new();
        let (ledger, persistence) = ledger(&wallet);

        ledger.extend_to(Chain::Main, 2).await.unwrap();
        assert_eq!(ledger.derived_addresses(Chain::Main).len(), 3);

        ledger.extend_to(Chain::Main, 2).await.unwrap();
        assert_eq!(ledger.derived_addresses(Chain::Main).len(), 3);

        ledger.extend_to(Chain::Main, 6).await.unwrap();
        let derived = ledger.derived_addresses(Chain::Main);
        assert_eq!(derived.len(), 7);
        assert_eq!(derived[6], wallet.main(6));
        assert_eq!(ledger.current_address(Chain::Main), Some(wallet.main(6)));
        assert_eq!(persistence.last_index(Chain::Main).await.unwrap(), Some(6));
        assert!(ledger.derived_addresses(Chain::Change).is_empty());
    }

    #[tokio::test]
    async fn derive_next_does_not_move_the_index() {
        let wallet = TestWallet::new();
        let (ledger, _) = ledger(&wallet);

        assert_eq!(ledger.derive_next(Chain::Change).unwrap(), wallet.change(0));
        ledger.extend_to(Chain::Change, 1).await.unwrap();
        assert_eq!(ledger.derive_next(Chain::Change).unwrap(), wallet.change(2));
        assert_eq!(ledger.last_index(Chain::Change), Some(1));
    }

    #[tokio::test]
    async fn cold_start_rederives_and_marks_stored_ranges_as_queried() {
        let wallet = TestWallet::new();
        let persistence = Arc::new(StatePersistenceService::in_memory());
        persistence.set_last_index(Chain::Main, 2).await.unwrap();

        let ledger = AddressLedger::load(wallet.deriver(), persistence).await.unwrap();

        assert_eq!(ledger.last_index(Chain::Main), Some(2));
        assert_eq!(ledger.last_index(Chain::Change), None);
        assert_eq!(ledger.queried_addresses(Chain::Main).len(), 3);
        assert!(ledger.is_queried(&wallet.main(2)));
        assert!(!ledger.is_queried(&wallet.main(3)));
        assert_eq!(ledger.current_address(Chain::Main), Some(wallet.main(2)));
    }

    #[tokio::test]
    async fn queried_addresses_are_recorded_once() {
        let wallet = TestWallet::new();
        let (ledger, _) = ledger(&wallet);

        ledger.mark_queried(Chain::Change, 4).unwrap();
        ledger.mark_queried(Chain::Change, 4).unwrap();

        assert_eq!(ledger.queried_addresses(Chain::Change), vec![wallet.change(4)]);
        assert!(ledger.is_queried(&wallet.change(4)));
        assert!(ledger.last_index(Chain::Change).is_none());
    }

    #[tokio::test]
    async fn events_extend_ranges_and_mint_change_after_broadcast() {
        let wallet = TestWallet::new();
        let (ledger, persistence) = ledger(&wallet);
        let ledger = Arc::new(ledger);
        let bus = DeterministicEventBus::new();
        ledger.subscribe(&bus);

        bus.publish(AddressRangeExtended {
            chain: Chain::Change,
            new_last_index: 1,
        });
        bus.publish(TransactionBroadcast {
            transaction: broadcast_record("spend"),
        });
        bus.drain().await;

        assert_eq!(ledger.last_index(Chain::Change), Some(2));
        assert_eq!(persistence.last_index(Chain::Change).await.unwrap(), Some(2));
        assert_eq!(ledger.current_address(Chain::Change), Some(wallet.change(2)));
    }

    #[tokio::test]
    async fn ownership_covers_the_next_change_address() {
        let wallet = TestWallet::new();
        let (ledger, _) = ledger(&wallet);
        ledger.extend_to(Chain::Change, 0).await.unwrap();

        assert!(ledger.owns(&wallet.change(0)));
        assert!(ledger.owns(&wallet.change(1)));
        assert!(!ledger.owns(&wallet.change(2)));
        assert!(!ledger.owns(&wallet.main(0)));
    }
}
