//! History synchronizer: address discovery and transaction reconciliation.
//!
//! This module defines the `HistorySynchronizer`, which drives a synchronization pass:
//! - For each derivation chain, addresses are scanned from index 0 until `gap_limit` consecutive
//!   addresses without history have been seen
//! - For every address with history, each transaction id is processed concurrently: known
//!   transactions are refreshed (confirmation, block time, ownership flags) and unknown ones are
//!   fetched, resolved and appended to the transaction log
//! - Granular facts are published on the event bus, followed by one `AddressesFetched` per address
//! - When both chains are done, the transaction log is persisted and `SyncCompleted` is published
//!
//! Network failures never abort a pass. An address whose history cannot be fetched falls back to
//! the transactions the local log already knows for it, and failures are reported through
//! `SyncOutcome::has_network_errors`. Only persistence errors and invariant violations are
//! returned as errors.

use crate::electrum::{ChainClient, TransactionDetail};
use crate::wallet::sync::{
    events::{
        AddressesFetched, EventBus, EventBusExt, EventHandler, InputMarkedUserOwned,
        OutputMarkedUserOwned, SubscriptionToken, SyncCompleted, SyncStarted, TransactionAdded,
        TransactionBroadcast, TransactionConfirmed, TransactionDateUpdated,
    },
    progress_tracker::{SyncProgressTracker, SyncStats},
    state_persistence::StatePersistenceService,
    strategies::{DerivationStrategy, SyncConfig},
    transaction_log::TransactionLog,
    transaction_processor::TransactionProcessor,
};
use crate::wallet::{TransactionRecord, WalletSyncError};

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::future::join_all;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one synchronization pass
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Some data could not be fetched and cached data was used instead
    pub has_network_errors: bool,
    pub stats: SyncStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordChange {
    Added,
    Updated,
    Unchanged,
    Failed,
}

/// What processing one transaction id at one address produced
struct ProcessOutcome {
    record: Option<TransactionRecord>,
    has_error: bool,
    change: RecordChange,
}

impl ProcessOutcome {
    fn failed() -> Self {
        Self {
            record: None,
            has_error: true,
            change: RecordChange::Failed,
        }
    }
}

/// Coordinates address discovery and transaction history reconciliation.
pub struct HistorySynchronizer {
    client: Arc<dyn ChainClient>,
    processor: TransactionProcessor,
    strategies: Vec<Arc<dyn DerivationStrategy>>,
    bus: Arc<dyn EventBus>,
    log: Arc<TransactionLog>,
    persistence: Arc<StatePersistenceService>,
    config: SyncConfig,
    /// Single permit: concurrent `sync_all` calls run one after another
    sync_lock: tokio::sync::Mutex<()>,
}

impl HistorySynchronizer {
    /// Create a synchronizer over `log`, scanning the chains of `strategies` in order.
    pub fn new(
        client: Arc<dyn ChainClient>,
        processor: TransactionProcessor,
        strategies: Vec<Arc<dyn DerivationStrategy>>,
        bus: Arc<dyn EventBus>,
        log: Arc<TransactionLog>,
        persistence: Arc<StatePersistenceService>,
        config: SyncConfig,
    ) -> Self {
        Self {
            client,
            processor,
            strategies,
            bus,
            log,
            persistence,
            config,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register the synchronizer's handlers on `bus`.
    pub fn subscribe(self: &Arc<Self>, bus: &dyn EventBus) -> SubscriptionToken {
        bus.subscribe::<TransactionBroadcast, _>(self.clone())
    }

    /// The transaction log this synchronizer maintains
    pub fn transaction_log(&self) -> Arc<TransactionLog> {
        self.log.clone()
    }

    /// Snapshot of every known transaction
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.log.snapshot()
    }

    /// Run one synchronization pass over every chain.
    ///
    /// Publishes `SyncStarted` before any work and `SyncCompleted` after the transaction log was
    /// persisted. A call made while another pass is running waits for it to finish.
    pub async fn sync_all(&self) -> Result<SyncOutcome, WalletSyncError> {
        let _guard = match self.sync_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Synchronization already running, waiting for it to finish");
                self.sync_lock.lock().await
            }
        };

        info!("Starting wallet synchronization");
        self.bus.publish(SyncStarted);

        let mut tracker = SyncProgressTracker::new();
        let mut has_network_errors = false;
        for strategy in &self.strategies {
            has_network_errors |= self.sync_chain(strategy.as_ref(), &mut tracker).await?;
        }

        self.persistence
            .save_transactions(&self.log.snapshot())
            .await?;

        let stats = tracker.get_stats();
        info!("Wallet synchronization completed: {}", stats.summary());
        if has_network_errors {
            warn!("Synchronization finished with network errors, cached history was used");
        }

        self.bus.publish(SyncCompleted {
            has_network_errors,
            stats: stats.clone(),
        });

        Ok(SyncOutcome {
            has_network_errors,
            stats,
        })
    }

    /// Scan one chain until `gap_limit` consecutive empty addresses were seen.
    ///
    /// Returns whether any network error occurred.
    async fn sync_chain(
        &self,
        strategy: &dyn DerivationStrategy,
        tracker: &mut SyncProgressTracker,
    ) -> Result<bool, WalletSyncError> {
        let chain = strategy.chain();
        debug!("Scanning {} chain with {}", chain, strategy.name());

        let mut empty_count = 0u32;
        let mut last_non_empty: Option<u32> = None;
        let mut index = 0u32;
        let mut has_errors = false;

        while empty_count < self.config.gap_limit {
            let address = strategy.derive_address(index)?;
            strategy.mark_queried(index)?;
            tracker.record_scanned(chain);

            let tx_ids: Vec<String> = match self.client.get_history(&address).await {
                Ok(tx_ids) => tx_ids,
                Err(e) => {
                    warn!(
                        "TxIds could not be fetched for address {}, using local history: {}",
                        address, e
                    );
                    has_errors = true;
                    tracker.record_failure();
                    tracker.record_fallback();
                    self.log.ids_touching(&address)
                }
            };
            let tx_ids: Vec<String> = tx_ids.into_iter().unique().collect();

            if tx_ids.is_empty() {
                empty_count += 1;
            } else {
                empty_count = 0;
                last_non_empty = Some(index);
                tracker.record_non_empty(chain, index);

                if self.fetch_and_reconcile(&tx_ids, &address, tracker).await {
                    warn!("Some transactions could not be fetched for address {}", address);
                    has_errors = true;
                }
            }

            index += 1;
        }

        if let Some(last) = last_non_empty {
            if strategy.last_known_index().is_none_or(|known| last > known) {
                strategy.publish_range_extended(last);
            }
        }

        tracker.log_chain_finished(chain);
        Ok(has_errors)
    }

    /// Process every id seen at `address` concurrently, then publish `AddressesFetched` once.
    ///
    /// Returns whether any id failed.
    async fn fetch_and_reconcile(
        &self,
        tx_ids: &[String],
        address: &str,
        tracker: &mut SyncProgressTracker,
    ) -> bool {
        let outcomes = join_all(
            tx_ids
                .iter()
                .map(|tx_id| self.process_transaction(tx_id, address)),
        )
        .await;

        let mut has_errors = false;
        let mut touched = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.change {
                RecordChange::Added => tracker.record_added(),
                RecordChange::Updated => tracker.record_updated(),
                RecordChange::Unchanged | RecordChange::Failed => {}
            }
            if outcome.has_error {
                has_errors = true;
                tracker.record_failure();
            }
            if let Some(record) = outcome.record {
                touched.push(record);
            }
        }

        debug!(
            "Fetched {} transactions for address {}",
            touched.len(),
            address
        );
        self.bus.publish(AddressesFetched {
            address: address.to_string(),
            transactions: touched,
        });

        has_errors
    }

    async fn process_transaction(&self, tx_id: &str, address: &str) -> ProcessOutcome {
        match self.log.get(tx_id) {
            Some(existing) => self.update_existing(existing, address).await,
            None => self.create_new(tx_id).await,
        }
    }

    async fn update_existing(&self, existing: TransactionRecord, address: &str) -> ProcessOutcome {
        let tx_id = existing.tx_id.as_str();
        let mut has_error = false;
        let mut changed = false;

        if !existing.confirmed {
            match self.client.get_transaction(tx_id).await {
                Ok(detail) => {
                    changed |= self.update_status(tx_id, &detail);
                    changed |= self.update_date(tx_id, &detail);
                }
                Err(e) => {
                    error!("Failed to update status of transaction {}: {}", tx_id, e);
                    has_error = true;
                }
            }
        }

        changed |= self.mark_user_owned(tx_id, address);

        ProcessOutcome {
            record: self.log.get(tx_id),
            has_error,
            change: if changed {
                RecordChange::Updated
            } else {
                RecordChange::Unchanged
            },
        }
    }

    async fn create_new(&self, tx_id: &str) -> ProcessOutcome {
        let detail = match self.client.get_transaction(tx_id).await {
            Ok(detail) => detail,
            Err(e) => {
                error!("Failed to fetch new transaction {}: {}", tx_id, e);
                return ProcessOutcome::failed();
            }
        };

        let record = match self
            .processor
            .record_from_detail(&detail, self.config.confirmation_threshold)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to create new transaction {}: {}", tx_id, e);
                return ProcessOutcome::failed();
            }
        };

        if !self.log.insert(record.clone()) {
            return ProcessOutcome {
                record: self.log.get(tx_id),
                has_error: false,
                change: RecordChange::Unchanged,
            };
        }

        debug!("Added transaction {} to the log", tx_id);
        self.bus.publish(TransactionAdded {
            transaction: record.clone(),
        });

        ProcessOutcome {
            record: Some(record),
            has_error: false,
            change: RecordChange::Added,
        }
    }

    /// Flip the confirmed flag once the threshold is reached. Never flips back.
    fn update_status(&self, tx_id: &str, detail: &TransactionDetail) -> bool {
        if detail.confirmations < self.config.confirmation_threshold {
            return false;
        }

        let newly_confirmed = self
            .log
            .update(tx_id, |record| !std::mem::replace(&mut record.confirmed, true))
            .unwrap_or(false);
        if newly_confirmed {
            info!(
                "Transaction {} confirmed ({} confirmations)",
                tx_id, detail.confirmations
            );
            self.bus.publish(TransactionConfirmed {
                tx_id: tx_id.to_string(),
            });
        }
        newly_confirmed
    }

    /// Replace an epoch placeholder date with the block time, once it is known.
    fn update_date(&self, tx_id: &str, detail: &TransactionDetail) -> bool {
        let Some(date) = detail.time.and_then(|time| DateTime::from_timestamp(time, 0)) else {
            return false;
        };

        let updated = self
            .log
            .update(tx_id, |record| {
                if record.has_unknown_date() {
                    record.date = date;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if updated {
            self.bus.publish(TransactionDateUpdated {
                tx_id: tx_id.to_string(),
                date,
            });
        }
        updated
    }

    /// Flag the first output and the first input at `address` as the wallet's own.
    /// Returns whether either flag was newly set.
    fn mark_user_owned(&self, tx_id: &str, address: &str) -> bool {
        let Some((output, input)) = self.log.update(tx_id, |record| {
            let output = record
                .outputs
                .iter_mut()
                .find(|output| output.address.as_deref() == Some(address))
                .filter(|output| !output.is_user_address)
                .map(|output| {
                    output.is_user_address = true;
                    output.clone()
                });
            let input = record
                .inputs
                .iter_mut()
                .find(|input| input.address.as_deref() == Some(address))
                .filter(|input| !input.is_user_address)
                .map(|input| {
                    input.is_user_address = true;
                    input.clone()
                });
            (output, input)
        }) else {
            return false;
        };
        let changed = output.is_some() || input.is_some();

        if let Some(output) = output {
            self.bus.publish(OutputMarkedUserOwned {
                tx_id: tx_id.to_string(),
                output,
            });
        }
        if let Some(input) = input {
            self.bus.publish(InputMarkedUserOwned {
                tx_id: tx_id.to_string(),
                input,
            });
        }
        changed
    }
}

#[async_trait]
impl EventHandler<TransactionBroadcast> for HistorySynchronizer {
    async fn handle(&self, event: &TransactionBroadcast) -> Result<(), WalletSyncError> {
        if self.log.insert(event.transaction.clone()) {
            debug!(
                "Added broadcast transaction {} to the log",
                event.transaction.tx_id
            );
        } else {
            warn!(
                "Broadcast transaction {} was already in the log",
                event.transaction.tx_id
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HistorySynchronizer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electrum::ChainPrevOutputLookup;
    use crate::test_support::{
        MockChainClient, TestWallet, broadcast_record, build_tx, coinbase_tx,
    };
    use crate::wallet::Chain;
    use crate::wallet::sync::address_ledger::AddressLedger;
    use crate::wallet::sync::balance::{BalanceLedger, UtxoRecord};
    use crate::wallet::sync::events::{
        AddressRangeExtended, BalanceUpdated, DeterministicEventBus, QueuedEventBus,
    };
    use crate::wallet::sync::repositories::{
        InMemoryAddressIndexRepository, TransactionRepository,
    };
    use crate::wallet::sync::strategies::ChainDerivationStrategy;
    use bitcoin::{Network, SignedAmount};
    use std::sync::Mutex;

    /// Bus a test can wait on until published events have reached their handlers
    #[async_trait]
    trait Settle: EventBus + 'static {
        async fn settle(&self);

        async fn close(&self) {}
    }

    #[async_trait]
    impl Settle for DeterministicEventBus {
        async fn settle(&self) {
            self.drain().await;
        }
    }

    #[async_trait]
    impl Settle for QueuedEventBus {
        async fn settle(&self) {
            // the second flush covers events published by handlers during the first
            self.flush().await.unwrap();
            self.flush().await.unwrap();
        }

        async fn close(&self) {
            self.shutdown().await.unwrap();
        }
    }

    struct Fixture<B = DeterministicEventBus> {
        wallet: TestWallet,
        client: Arc<MockChainClient>,
        bus: Arc<B>,
        ledger: Arc<AddressLedger>,
        persistence: Arc<StatePersistenceService>,
        sync: Arc<HistorySynchronizer>,
    }

    fn fixture(gap_limit: u32) -> Fixture {
        fixture_with(gap_limit, Arc::new(StatePersistenceService::in_memory()))
    }

    fn fixture_with(gap_limit: u32, persistence: Arc<StatePersistenceService>) -> Fixture {
        fixture_on(gap_limit, persistence, Arc::new(DeterministicEventBus::new()))
    }

    fn fixture_on<B: Settle>(
        gap_limit: u32,
        persistence: Arc<StatePersistenceService>,
        bus: Arc<B>,
    ) -> Fixture<B> {
        let wallet = TestWallet::new();
        let client = Arc::new(MockChainClient::new());
        let ledger = Arc::new(AddressLedger::new(wallet.deriver(), persistence.clone()));
        ledger.subscribe(bus.as_ref());

        let processor = TransactionProcessor::new(
            Network::Regtest,
            Arc::new(ChainPrevOutputLookup::new(client.clone(), Network::Regtest)),
            ledger.clone(),
        );
        let strategies: Vec<Arc<dyn DerivationStrategy>> = vec![
            Arc::new(ChainDerivationStrategy::main(ledger.clone(), bus.clone())),
            Arc::new(ChainDerivationStrategy::change(ledger.clone(), bus.clone())),
        ];
        let sync = Arc::new(HistorySynchronizer::new(
            client.clone(),
            processor,
            strategies,
            bus.clone(),
            Arc::new(TransactionLog::default()),
            persistence.clone(),
            SyncConfig::with_gap_limit(gap_limit),
        ));
        sync.subscribe(bus.as_ref());

        Fixture {
            wallet,
            client,
            bus,
            ledger,
            persistence,
            sync,
        }
    }

    impl<B: Settle> Fixture<B> {
        async fn sync(&self) -> SyncOutcome {
            let outcome = self.sync.sync_all().await.unwrap();
            self.bus.settle().await;
            outcome
        }
    }

    #[tokio::test]
    async fn gap_limit_scan_visits_one_more_address_than_the_limit() {
        let f = fixture(6);
        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 100_000)]);
        f.client.fund(&funding, &[&f.wallet.main(0)], 10, Some(1_700_000_000));

        let outcome = f.sync().await;

        assert!(!outcome.has_network_errors);
        assert_eq!(outcome.stats.addresses_scanned(Chain::Main), 7);
        assert_eq!(outcome.stats.last_non_empty(Chain::Main), Some(0));
        assert_eq!(outcome.stats.addresses_scanned(Chain::Change), 6);
        let main_calls: Vec<String> = (0..7).map(|i| f.wallet.main(i)).collect();
        assert_eq!(f.client.history_calls()[..7], main_calls[..]);
        assert_eq!(
            f.bus.published::<AddressRangeExtended>(),
            vec![AddressRangeExtended {
                chain: Chain::Main,
                new_last_index: 0
            }]
        );
        assert_eq!(f.ledger.last_index(Chain::Main), Some(0));
        assert_eq!(f.ledger.last_index(Chain::Change), None);

        // same activity again: nothing new to announce
        f.sync().await;
        assert_eq!(f.bus.published::<AddressRangeExtended>().len(), 1);
    }

    #[tokio::test]
    async fn activity_inside_the_gap_resets_the_empty_counter() {
        let f = fixture(3);
        let first = coinbase_tx(&[(f.wallet.main(0).as_str(), 1_000)]);
        let later = coinbase_tx(&[(f.wallet.main(3).as_str(), 2_000)]);
        f.client.fund(&first, &[&f.wallet.main(0)], 10, None);
        f.client.fund(&later, &[&f.wallet.main(3)], 10, None);

        let outcome = f.sync().await;

        assert_eq!(outcome.stats.addresses_scanned(Chain::Main), 7);
        assert_eq!(outcome.stats.last_non_empty(Chain::Main), Some(3));
        assert_eq!(f.ledger.last_index(Chain::Main), Some(3));
        assert_eq!(f.ledger.derived_addresses(Chain::Main).len(), 4);
    }

    #[tokio::test]
    async fn new_transactions_are_added_published_and_persisted() {
        let f = fixture(2);
        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 50_000)]);
        f.client.fund(&funding, &[&f.wallet.main(0)], 20, Some(1_700_000_000));

        let outcome = f.sync().await;

        assert_eq!(outcome.stats.transactions_added, 1);
        let added = f.bus.published::<TransactionAdded>();
        assert_eq!(added.len(), 1);
        assert!(added[0].transaction.confirmed);
        assert!(added[0].transaction.outputs[0].is_user_address);

        let fetched = f.bus.published::<AddressesFetched>();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].address, f.wallet.main(0));
        assert_eq!(fetched[0].transactions, vec![added[0].transaction.clone()]);

        assert_eq!(
            f.persistence.load_transactions().await.unwrap(),
            f.sync.transactions()
        );
        let names = f.bus.published_names();
        assert_eq!(names.first(), Some(&"SyncStarted"));
        assert_eq!(names.last(), Some(&"SyncCompleted"));
    }

    #[tokio::test]
    async fn confirmation_and_date_are_refreshed_once() {
        let f = fixture(1);
        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 5_000)]);
        let tx_id = funding.compute_txid().to_string();
        f.client.fund(&funding, &[&f.wallet.main(0)], 0, None);

        f.sync().await;
        let stored = f.sync.transaction_log().get(&tx_id).unwrap();
        assert!(!stored.confirmed);
        assert!(stored.has_unknown_date());

        f.client.set_confirmations(&tx_id, 6, Some(1_700_000_600));
        f.sync().await;
        f.client.set_confirmations(&tx_id, 12, Some(1_700_000_600));
        f.sync().await;

        let stored = f.sync.transaction_log().get(&tx_id).unwrap();
        assert!(stored.confirmed);
        assert_eq!(stored.date.timestamp(), 1_700_000_600);
        assert_eq!(
            f.bus.published::<TransactionConfirmed>(),
            vec![TransactionConfirmed { tx_id: tx_id.clone() }]
        );
        assert_eq!(f.bus.published::<TransactionDateUpdated>().len(), 1);

        // confirmed records are not fetched again
        let fetches = f
            .client
            .transaction_calls()
            .iter()
            .filter(|id| **id == tx_id)
            .count();
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn known_transactions_count_as_updated_only_when_they_change() {
        let f = fixture(1);
        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 5_000)]);
        let tx_id = funding.compute_txid().to_string();
        f.client.fund(&funding, &[&f.wallet.main(0)], 0, None);

        let first = f.sync().await;
        assert_eq!(first.stats.transactions_added, 1);

        let idle = f.sync().await;
        assert_eq!(idle.stats.transactions_added, 0);
        assert_eq!(idle.stats.transactions_updated, 0);

        f.client.set_confirmations(&tx_id, 6, Some(1_700_000_600));
        let confirming = f.sync().await;
        assert_eq!(confirming.stats.transactions_updated, 1);

        let settled = f.sync().await;
        assert_eq!(settled.stats.transactions_updated, 0);
    }

    #[tokio::test]
    async fn failed_history_falls_back_to_the_local_log() {
        let f = fixture(2);
        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 5_000)]);
        f.client.fund(&funding, &[&f.wallet.main(0)], 10, None);
        f.sync().await;

        f.client.fail_history(&f.wallet.main(0));
        let outcome = f.sync().await;

        assert!(outcome.has_network_errors);
        assert_eq!(outcome.stats.history_fallbacks, 1);
        assert_eq!(outcome.stats.last_non_empty(Chain::Main), Some(0));
        let fetched = f.bus.published::<AddressesFetched>();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].transactions.len(), 1);
        assert_eq!(f.ledger.last_index(Chain::Main), Some(0));
    }

    #[tokio::test]
    async fn one_failing_transaction_does_not_stop_the_others() {
        let f = fixture(1);
        let good = coinbase_tx(&[(f.wallet.main(0).as_str(), 1_000)]);
        let bad = coinbase_tx(&[(f.wallet.main(0).as_str(), 2_000)]);
        f.client.fund(&good, &[&f.wallet.main(0)], 10, None);
        f.client.fund(&bad, &[&f.wallet.main(0)], 10, None);
        f.client.fail_transaction(&bad.compute_txid().to_string());

        let outcome = f.sync().await;

        assert!(outcome.has_network_errors);
        assert_eq!(outcome.stats.transactions_added, 1);
        assert_eq!(f.sync.transactions().len(), 1);
        assert_eq!(f.bus.published::<AddressesFetched>()[0].transactions.len(), 1);

        f.client.recover_transaction(&bad.compute_txid().to_string());
        let outcome = f.sync().await;
        assert!(!outcome.has_network_errors);
        assert_eq!(f.sync.transactions().len(), 2);
    }

    #[tokio::test]
    async fn later_queried_addresses_mark_outputs_and_inputs_as_owned() {
        let f = fixture(2);
        let funding = coinbase_tx(&[(f.wallet.change(0).as_str(), 9_000)]);
        let spend = build_tx(
            &[(funding.compute_txid(), 0)],
            &[(f.wallet.main(0).as_str(), 4_000), (f.wallet.main(1).as_str(), 4_000)],
        );
        f.client.fund(&funding, &[&f.wallet.change(0)], 10, None);
        f.client.fund(
            &spend,
            &[&f.wallet.main(0), &f.wallet.main(1), &f.wallet.change(0)],
            10,
            None,
        );

        f.sync().await;

        let spend_id = spend.compute_txid().to_string();
        let outputs = f.bus.published::<OutputMarkedUserOwned>();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].tx_id, spend_id);
        assert_eq!(
            outputs[0].output.address.as_deref(),
            Some(f.wallet.main(1).as_str())
        );

        let inputs = f.bus.published::<InputMarkedUserOwned>();
        assert_eq!(inputs.len(), 1);
        assert_eq!(
            inputs[0].input.address.as_deref(),
            Some(f.wallet.change(0).as_str())
        );

        let stored = f.sync.transaction_log().get(&spend_id).unwrap();
        assert!(stored.outputs.iter().all(|o| o.is_user_address));
        assert!(stored.inputs[0].is_user_address);

        f.sync().await;
        assert_eq!(f.bus.published::<OutputMarkedUserOwned>().len(), 1);
        assert_eq!(f.bus.published::<InputMarkedUserOwned>().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_syncs_run_one_after_another() {
        let f = fixture(1);

        let (first, second) = tokio::join!(f.sync.sync_all(), f.sync.sync_all());
        first.unwrap();
        second.unwrap();

        let lifecycle: Vec<&str> = f
            .bus
            .published_names()
            .into_iter()
            .filter(|name| name.starts_with("Sync"))
            .collect();
        assert_eq!(
            lifecycle,
            vec!["SyncStarted", "SyncCompleted", "SyncStarted", "SyncCompleted"]
        );
    }

    #[tokio::test]
    async fn broadcast_transactions_are_appended_to_the_log() {
        let f = fixture(1);

        f.bus.publish(TransactionBroadcast {
            transaction: broadcast_record("fresh"),
        });
        f.bus.drain().await;

        assert!(f.sync.transaction_log().contains("fresh"));
    }

    fn utxo_summary(utxos: Vec<UtxoRecord>) -> Vec<(String, u64, bool)> {
        utxos
            .into_iter()
            .map(|utxo| (utxo.address, utxo.amount.to_sat(), utxo.confirmed))
            .collect()
    }

    /// Fund, sync, spend with change, sync again, then rebuild the balances from disk.
    async fn spend_with_change_reaches_the_balance_ledger<B: Settle>(bus: Arc<B>) {
        let f = fixture_on(2, Arc::new(StatePersistenceService::in_memory()), bus);
        let balance = Arc::new(BalanceLedger::new(f.sync.transaction_log(), f.bus.clone()));
        balance.subscribe(f.bus.as_ref());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let recorded = updates.clone();
        f.bus.subscribe_fn::<BalanceUpdated, _>("recorder", move |event| {
            recorded.lock().unwrap().push(event.clone());
            Ok(())
        });

        let funding = coinbase_tx(&[(f.wallet.main(0).as_str(), 10_000)]);
        f.client.fund(&funding, &[&f.wallet.main(0)], 10, Some(1_700_000_000));
        f.sync().await;

        assert_eq!(balance.confirmed_balance(), SignedAmount::from_sat(10_000));
        assert_eq!(balance.unconfirmed_balance(), SignedAmount::ZERO);

        let spend = build_tx(
            &[(funding.compute_txid(), 0)],
            &[
                (f.wallet.external(0).as_str(), 6_000),
                (f.wallet.change(0).as_str(), 3_000),
            ],
        );
        f.client.fund(&spend, &[&f.wallet.main(0), &f.wallet.change(0)], 0, None);
        f.sync().await;

        let expected = vec![(f.wallet.change(0), 3_000, false)];
        assert_eq!(balance.confirmed_balance(), SignedAmount::ZERO);
        assert_eq!(balance.unconfirmed_balance(), SignedAmount::from_sat(3_000));
        assert_eq!(utxo_summary(balance.utxos()), expected);
        assert_eq!(
            updates.lock().unwrap().last(),
            Some(&BalanceUpdated {
                confirmed: SignedAmount::ZERO,
                unconfirmed: SignedAmount::from_sat(3_000),
            })
        );

        let records = f.persistence.load_transactions().await.unwrap();
        let restored = BalanceLedger::new(Arc::new(TransactionLog::new(records)), f.bus.clone());
        assert_eq!(restored.confirmed_balance(), SignedAmount::ZERO);
        assert_eq!(restored.unconfirmed_balance(), SignedAmount::from_sat(3_000));
        assert_eq!(utxo_summary(restored.utxos()), expected);

        f.bus.close().await;
    }

    #[tokio::test]
    async fn balances_follow_syncs_and_survive_a_restart() {
        spend_with_change_reaches_the_balance_ledger(Arc::new(DeterministicEventBus::new())).await;
    }

    #[tokio::test]
    async fn queued_bus_produces_the_same_balances() {
        spend_with_change_reaches_the_balance_ledger(Arc::new(QueuedEventBus::start())).await;
    }

    struct FailingRepository;

    #[async_trait]
    impl TransactionRepository for FailingRepository {
        async fn save(&self, _: &[TransactionRecord]) -> Result<(), WalletSyncError> {
            Err(WalletSyncError::Persistence("disk full".into()))
        }

        async fn load(&self) -> Result<Vec<TransactionRecord>, WalletSyncError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persistence_errors_are_returned_and_skip_completion() {
        let persistence = Arc::new(StatePersistenceService::with_repositories(
            Box::new(FailingRepository),
            Box::new(InMemoryAddressIndexRepository::default()),
        ));
        let f = fixture_with(1, persistence);

        let result = f.sync.sync_all().await;

        assert!(matches!(result, Err(WalletSyncError::Persistence(_))));
        assert!(f.bus.published::<SyncCompleted>().is_empty());
    }
}
