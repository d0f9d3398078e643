use btc_wallet_sync::config::{CONFIG_PATH_ENV, WalletConfig};
use btc_wallet_sync::electrum::{ChainClient, ChainPrevOutputLookup, ElectrumChainClient};
use btc_wallet_sync::utils::format_btc_amount;
use btc_wallet_sync::wallet::sync::events::{BalanceUpdated, SyncCompleted};
use btc_wallet_sync::wallet::sync::{
	AddressLedger, BalanceLedger, ChainDerivationStrategy, DerivationStrategy, EventBusExt,
	HistorySynchronizer, QueuedEventBus, StatePersistenceService, SyncConfig, TransactionLog,
	TransactionProcessor,
};
use btc_wallet_sync::wallet::{self, AddressDeriver, Bip32AddressDeriver, Chain};

use bitcoin::Network;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// RUST_LOG wins; otherwise info for everything and debug for this crate
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("info,btc_wallet_sync=debug")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");

	let config = match std::env::var(CONFIG_PATH_ENV) {
		Ok(path) => match WalletConfig::load(Path::new(&path)) {
			Ok(config) => config,
			Err(e) => {
				error!("Failed to load configuration from {}: {}", path, e);
				return;
			}
		},
		Err(_) => {
			info!("{} is not set, using regtest defaults", CONFIG_PATH_ENV);
			WalletConfig::default_regtest()
		}
	};
	let network: Network = config.node.network.into();

	let deriver = match &config.wallet.account_xpub {
		Some(xpub) => Bip32AddressDeriver::from_xpub(xpub, network, config.wallet.address_kind),
		None => {
			warn!("No account xpub configured, deriving from a random seed");
			Bip32AddressDeriver::from_seed(
				&wallet::generate_random_seed(),
				network,
				config.wallet.address_kind,
			)
		}
	};
	let deriver: Arc<dyn AddressDeriver> = match deriver {
		Ok(deriver) => Arc::new(deriver),
		Err(e) => {
			error!("Failed to set up key material: {}", e);
			return;
		}
	};

	let persistence = Arc::new(StatePersistenceService::new(config.wallet.data_dir.clone()));

	let client: Arc<dyn ChainClient> = match ElectrumChainClient::connect(&config.node).await {
		Ok(client) => Arc::new(client),
		Err(e) => {
			error!("Failed to connect to {}: {}", config.node.electrum_url(), e);
			return;
		}
	};

	let bus = Arc::new(QueuedEventBus::start());

	let ledger = match AddressLedger::load(deriver, persistence.clone()).await {
		Ok(ledger) => Arc::new(ledger),
		Err(e) => {
			error!("Failed to restore address indices: {}", e);
			return;
		}
	};
	ledger.subscribe(bus.as_ref());

	let records = match persistence.load_transactions().await {
		Ok(records) => records,
		Err(e) => {
			error!("Failed to restore transactions: {}", e);
			return;
		}
	};
	let log = Arc::new(TransactionLog::new(records));
	info!("Restored {} transactions", log.len());

	let processor = TransactionProcessor::new(
		network,
		Arc::new(ChainPrevOutputLookup::new(client.clone(), network)),
		ledger.clone(),
	);
	let strategies: Vec<Arc<dyn DerivationStrategy>> = vec![
		Arc::new(ChainDerivationStrategy::main(ledger.clone(), bus.clone())),
		Arc::new(ChainDerivationStrategy::change(ledger.clone(), bus.clone())),
	];
	let synchronizer = Arc::new(HistorySynchronizer::new(
		client,
		processor,
		strategies,
		bus.clone(),
		log.clone(),
		persistence,
		SyncConfig::with_gap_limit(config.node.gap_limit),
	));
	synchronizer.subscribe(bus.as_ref());

	let balance = Arc::new(BalanceLedger::new(log, bus.clone()));
	balance.subscribe(bus.as_ref());

	bus.subscribe_fn::<BalanceUpdated, _>("BalanceLogger", |event| {
		debug!(
			"Balance updated: confirmed {}, unconfirmed {}",
			format_btc_amount(event.confirmed),
			format_btc_amount(event.unconfirmed)
		);
		Ok(())
	});
	bus.subscribe_fn::<SyncCompleted, _>("SyncLogger", |event| {
		if event.has_network_errors {
			warn!("Sync completed with network errors");
		}
		Ok(())
	});

	info!("Created wallet sync service");

	match synchronizer.sync_all().await {
		Ok(outcome) => info!(
			"Synchronization finished ({}network errors): {}",
			if outcome.has_network_errors { "" } else { "no " },
			outcome.stats.summary()
		),
		Err(e) => error!("Failed to sync wallet: {}", e),
	}

	if let Err(e) = bus.flush().await {
		error!("Failed to flush events: {}", e);
	}

	match ledger.derive_next(Chain::Main) {
		Ok(address) => info!("Next receive address: {}", address),
		Err(e) => error!("Failed to derive receive address: {}", e),
	}
	info!("Transactions: {}", synchronizer.transactions().len());
	info!("UTXOs: {}", balance.utxos().len());
	info!(
		"Confirmed balance: {}",
		format_btc_amount(balance.confirmed_balance())
	);
	info!(
		"Unconfirmed balance: {}",
		format_btc_amount(balance.unconfirmed_balance())
	);

	if let Err(e) = bus.shutdown().await {
		error!("Failed to stop event bus: {}", e);
	}
}
