//! Event system for wallet synchronization.
//!
//! This module defines the event types, the event handler traits, and the event bus used
//! throughout the wallet. Components never call each other directly: the history synchronizer
//! publishes facts about transactions and addresses, and the address ledger and balance ledger
//! subscribe to the facts they maintain state from.
//!
//! Handlers are registered per event type. The registry maps the event's `TypeId` to an ordered
//! list of type-erased wrappers, each of which holds the strongly-typed handler it was created
//! from, so dispatch never needs to inspect handler types at runtime.
//!
//! Two buses implement the [`EventBus`] trait:
//! - [`QueuedEventBus`]: a single background consumer fed by an unbounded channel. Delivery order
//!   equals publish order and at most one handler runs at a time.
//! - [`DeterministicEventBus`]: queues events until [`DeterministicEventBus::drain`] is awaited,
//!   which makes tests independent of task scheduling.

use crate::wallet::sync::progress_tracker::SyncStats;
use crate::wallet::{Chain, InputRecord, OutputRecord, TransactionRecord, WalletSyncError};

use async_trait::async_trait;
use bitcoin::SignedAmount;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An immutable fact published on the bus
pub trait Event: Any + Send + Sync + Debug + Clone {
    /// Name used in logs
    const NAME: &'static str;
}

/// A chain's last used index moved forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRangeExtended {
    pub chain: Chain,
    pub new_last_index: u32,
}

/// All transactions observed at one address were fetched and reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressesFetched {
    pub address: String,
    pub transactions: Vec<TransactionRecord>,
}

/// A previously unseen transaction was appended to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionAdded {
    pub transaction: TransactionRecord,
}

/// A transaction crossed the confirmation threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfirmed {
    pub tx_id: String,
}

/// A transaction's epoch placeholder date was replaced by its block time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDateUpdated {
    pub tx_id: String,
    pub date: DateTime<Utc>,
}

/// New aggregate balances after the balance ledger applied a fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdated {
    pub confirmed: SignedAmount,
    pub unconfirmed: SignedAmount,
}

/// A synchronization pass started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStarted;

/// A synchronization pass finished and the transaction log was persisted
#[derive(Debug, Clone)]
pub struct SyncCompleted {
    pub has_network_errors: bool,
    pub stats: SyncStats,
}

/// A locally built transaction was accepted by the chain server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBroadcast {
    pub transaction: TransactionRecord,
}

/// A stored input turned out to spend from one of the wallet's addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMarkedUserOwned {
    pub tx_id: String,
    pub input: InputRecord,
}

/// A stored output turned out to pay one of the wallet's addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMarkedUserOwned {
    pub tx_id: String,
    pub output: OutputRecord,
}

macro_rules! impl_event {
    ($($ty:ident),* $(,)?) => {
        $(impl Event for $ty {
            const NAME: &'static str = stringify!($ty);
        })*
    };
}

impl_event!(
    AddressRangeExtended,
    AddressesFetched,
    TransactionAdded,
    TransactionConfirmed,
    TransactionDateUpdated,
    BalanceUpdated,
    SyncStarted,
    SyncCompleted,
    TransactionBroadcast,
    InputMarkedUserOwned,
    OutputMarkedUserOwned,
);

/// Trait for handling one kind of event.
///
/// A component may implement it for several event types.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Handle an event.
    ///
    /// Errors are logged by the bus and do not affect other handlers or later events.
    async fn handle(&self, event: &E) -> Result<(), WalletSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Handler backed by a synchronous closure, for lightweight observers
pub struct FnHandler<E, F> {
    name: &'static str,
    callback: F,
    _event: PhantomData<fn(E)>,
}

impl<E, F> FnHandler<E, F>
where
    E: Event,
    F: Fn(&E) -> Result<(), WalletSyncError> + Send + Sync + 'static,
{
    pub fn new(name: &'static str, callback: F) -> Self {
        Self {
            name,
            callback,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F> EventHandler<E> for FnHandler<E, F>
where
    E: Event,
    F: Fn(&E) -> Result<(), WalletSyncError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &E) -> Result<(), WalletSyncError> {
        (self.callback)(event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Identifies one subscription for [`EventBusExt::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// A published event with its payload type erased
#[derive(Clone)]
pub struct PublishedEvent {
    type_id: TypeId,
    name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl PublishedEvent {
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            name: E::NAME,
            payload: Arc::new(event),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The payload, if this event is an `E`
    pub fn downcast<E: Event>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }
}

impl Debug for PublishedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedEvent")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle_erased(&self, event: &PublishedEvent) -> Result<(), WalletSyncError>;

    fn name(&self) -> &'static str;
}

struct TypedHandler<E, H: ?Sized> {
    handler: Arc<H>,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E> + ?Sized + 'static,
{
    async fn handle_erased(&self, event: &PublishedEvent) -> Result<(), WalletSyncError> {
        match event.downcast::<E>() {
            Some(event) => self.handler.handle(event).await,
            None => Err(WalletSyncError::SyncError(format!(
                "{} delivered to handler of {}",
                event.name(),
                E::NAME
            ))),
        }
    }

    fn name(&self) -> &'static str {
        EventHandler::<E>::name(self.handler.as_ref())
    }
}

type HandlerList = Vec<(SubscriptionToken, Arc<dyn ErasedHandler>)>;

/// Per event type, the ordered handlers subscribed to it
#[derive(Default)]
pub struct HandlerRegistry {
    next_token: Mutex<u64>,
    handlers: RwLock<HashMap<TypeId, HandlerList>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<E, H>(&self, handler: Arc<H>) -> SubscriptionToken
    where
        E: Event,
        H: EventHandler<E> + ?Sized + 'static,
    {
        let token = {
            let mut next = self.next_token.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            SubscriptionToken(*next)
        };
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler::<E, H> {
            handler,
            _event: PhantomData,
        });

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push((token, erased));
        debug!(event = E::NAME, token = token.0, "Handler subscribed");
        token
    }

    fn remove(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for list in handlers.values_mut() {
            if let Some(position) = list.iter().position(|(t, _)| *t == token) {
                list.remove(position);
                return true;
            }
        }
        false
    }

    /// Number of handlers currently subscribed to `E`
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Dispatch an event to its handlers in subscription order.
    ///
    /// Errors and panics from handlers are logged, but do not stop other handlers from running.
    /// The logged failures are returned, a panic surfacing as [`WalletSyncError::HandlerPanicked`].
    pub async fn dispatch(&self, event: &PublishedEvent) -> Vec<WalletSyncError> {
        let handlers: Vec<Arc<dyn ErasedHandler>> = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match guard.get(&event.type_id) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return Vec::new(),
            }
        };

        let mut failures = Vec::new();
        for handler in handlers {
            let result = match AssertUnwindSafe(handler.handle_erased(event))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(WalletSyncError::HandlerPanicked(panic_message(
                    panic.as_ref(),
                ))),
            };
            if let Err(e) = result {
                error!(
                    "Handler {} failed to process event {}: {}",
                    handler.name(),
                    event.name(),
                    e
                );
                failures.push(e);
            }
        }
        failures
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// In-process publish/subscribe channel shared by all wallet components
pub trait EventBus: Send + Sync {
    /// Enqueue an event without waiting for its handlers.
    fn enqueue(&self, event: PublishedEvent);

    fn registry(&self) -> &HandlerRegistry;
}

/// Typed convenience API over any [`EventBus`], including `dyn EventBus`
pub trait EventBusExt: EventBus {
    fn publish<E: Event>(&self, event: E) {
        self.enqueue(PublishedEvent::new(event));
    }

    fn subscribe<E, H>(&self, handler: Arc<H>) -> SubscriptionToken
    where
        E: Event,
        H: EventHandler<E> + ?Sized + 'static,
    {
        self.registry().insert::<E, H>(handler)
    }

    fn subscribe_fn<E, F>(&self, name: &'static str, callback: F) -> SubscriptionToken
    where
        E: Event,
        F: Fn(&E) -> Result<(), WalletSyncError> + Send + Sync + 'static,
    {
        self.subscribe::<E, _>(Arc::new(FnHandler::new(name, callback)))
    }

    /// Remove a subscription. Returns false if the token was unknown.
    fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.registry().remove(token)
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}

enum Envelope {
    Event(PublishedEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Event bus with a single background consumer.
///
/// `publish` never blocks. The consumer task dequeues envelopes in order and awaits every handler
/// of an event before moving to the next one.
pub struct QueuedEventBus {
    registry: Arc<HandlerRegistry>,
    sender: mpsc::UnboundedSender<Envelope>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedEventBus {
    /// Create the bus and spawn its consumer on the current Tokio runtime.
    pub fn start() -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(registry.clone(), receiver));

        Self {
            registry,
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run(registry: Arc<HandlerRegistry>, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
        debug!("Event bus consumer started");
        while let Some(envelope) = receiver.recv().await {
            match envelope {
                Envelope::Event(event) => {
                    registry.dispatch(&event).await;
                }
                Envelope::Flush(done) => {
                    let _ = done.send(());
                }
                Envelope::Shutdown => break,
            }
        }

        let mut abandoned = 0usize;
        while let Ok(envelope) = receiver.try_recv() {
            if let Envelope::Event(_) = envelope {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!("Event bus stopped with {} undelivered events", abandoned);
        }
        debug!("Event bus consumer stopped");
    }

    /// Wait until every event published before this call has been dispatched.
    pub async fn flush(&self) -> Result<(), WalletSyncError> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(Envelope::Flush(done))
            .map_err(|_| WalletSyncError::SyncError("Event bus is shut down".into()))?;
        wait.await
            .map_err(|_| WalletSyncError::SyncError("Event bus stopped before flushing".into()))
    }

    /// Deliver everything already queued, stop the consumer and join it.
    ///
    /// Events published after shutdown are dropped.
    pub async fn shutdown(&self) -> Result<(), WalletSyncError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        let _ = self.sender.send(Envelope::Shutdown);
        worker
            .await
            .map_err(|e| WalletSyncError::SyncError(format!("Event bus consumer failed: {}", e)))?;
        info!("Event bus shut down");
        Ok(())
    }
}

impl EventBus for QueuedEventBus {
    fn enqueue(&self, event: PublishedEvent) {
        let name = event.name();
        if self.sender.send(Envelope::Event(event)).is_err() {
            warn!(event = name, "Event dropped (bus is shut down)");
        } else {
            debug!(event = name, "Event published");
        }
    }

    fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

/// Event bus that only dispatches when asked to.
///
/// Every published event is also kept in a history so tests can assert on what was emitted.
#[derive(Default)]
pub struct DeterministicEventBus {
    registry: HandlerRegistry,
    queue: Mutex<VecDeque<PublishedEvent>>,
    history: Mutex<Vec<PublishedEvent>>,
}

impl DeterministicEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch queued events, including events published by handlers, until none are left.
    ///
    /// Returns the number of events dispatched.
    pub async fn drain(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(event) = next else {
                return dispatched;
            };
            self.registry.dispatch(&event).await;
            dispatched += 1;
        }
    }

    /// Every published `E`, in publish order
    pub fn published<E: Event>(&self) -> Vec<E> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|event| event.downcast::<E>().cloned())
            .collect()
    }

    /// Names of every published event, in publish order
    pub fn published_names(&self) -> Vec<&'static str> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(PublishedEvent::name)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl EventBus for DeterministicEventBus {
    fn enqueue(&self, event: PublishedEvent) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}
