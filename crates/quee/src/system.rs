//! Assembly and lifecycle of a queue system.
//!
//! All registration happens on a [`QueueSystemBuilder`] before any consumer
//! runs. Conflicting registrations are rejected immediately by the
//! [`QueueRegistry`], so a built [`QueueSystem`] is always internally
//! consistent.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use quee::{Consumer, FaultMessage, Message, QueueName, QueueSystemBuilder};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! struct OrderConsumer;
//!
//! #[async_trait]
//! impl Consumer<String> for OrderConsumer {
//!     async fn consume(&self, message: Message<String>) -> anyhow::Result<()> {
//!         println!("processing {}", message.payload);
//!         Ok(())
//!     }
//!
//!     async fn consume_fault(&self, message: FaultMessage<String>) -> anyhow::Result<()> {
//!         eprintln!("gave up on {}: {:?}", message.payload, message.exceptions);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), quee::QueueError> {
//! let orders = QueueName::new("orders".to_string())?;
//! let system = QueueSystemBuilder::in_memory()
//!     .add_message_tracker(1_000)?
//!     .add_sender_and_consumer::<String, _>(
//!         orders.clone(),
//!         [Duration::from_millis(100), Duration::from_secs(1)],
//!         || OrderConsumer,
//!     )?
//!     .build()?;
//!
//! let running = system.start(CancellationToken::new()).await?;
//! system.send("order-1".to_string()).await?;
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{QueueEntrySettings, QueueSettings};
use crate::consumer::{ConsumerFactory, ConsumerOptions};
use crate::consumer_loop::ConsumerLoop;
use crate::delivery::DeliveryQueue;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigurationError, QueueError, RegistrationRole};
use crate::message::{MessageId, Payload, QueueName};
use crate::monitor::{QueueMonitor, DEFAULT_POLL_INTERVAL};
use crate::retry::RetryOptions;
use crate::sender::{InMemorySender, QueueSender, TransportSender};
use crate::tracking::TrackingService;
use crate::transport::{SubscribeOptions, Transport, TransportConsumer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "system_tests.rs"]
mod tests;

// ============================================================================
// QueueRegistry
// ============================================================================

#[derive(Debug, Clone)]
struct Binding {
    type_id: TypeId,
    type_name: &'static str,
}

/// Registration guard: one sender and one consumer per queue, one sender per
/// message type, and one message type per queue.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queue_types: HashMap<QueueName, Binding>,
    senders_by_queue: HashMap<QueueName, &'static str>,
    senders_by_type: HashMap<TypeId, QueueName>,
    consumers_by_queue: HashMap<QueueName, &'static str>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the sender side of `queue_name` for message type `T`
    pub fn register_sender<T: 'static>(&mut self, queue_name: &QueueName) -> Result<(), QueueError> {
        let conflict = || QueueError::RegistrationConflict {
            role: RegistrationRole::Sender,
            queue_name: queue_name.to_string(),
            message_type: type_name::<T>(),
        };

        self.check_binding::<T>(queue_name, RegistrationRole::Sender)?;
        if self.senders_by_queue.contains_key(queue_name) {
            return Err(conflict());
        }
        if let Some(existing) = self.senders_by_type.get(&TypeId::of::<T>()) {
            return Err(QueueError::RegistrationConflict {
                role: RegistrationRole::Sender,
                queue_name: existing.to_string(),
                message_type: type_name::<T>(),
            });
        }

        self.bind::<T>(queue_name);
        self.senders_by_queue
            .insert(queue_name.clone(), type_name::<T>());
        self.senders_by_type
            .insert(TypeId::of::<T>(), queue_name.clone());
        Ok(())
    }

    /// Claim the consumer side of `queue_name` for message type `T`
    pub fn register_consumer<T: 'static>(
        &mut self,
        queue_name: &QueueName,
    ) -> Result<(), QueueError> {
        self.check_binding::<T>(queue_name, RegistrationRole::Consumer)?;
        if self.consumers_by_queue.contains_key(queue_name) {
            return Err(QueueError::RegistrationConflict {
                role: RegistrationRole::Consumer,
                queue_name: queue_name.to_string(),
                message_type: type_name::<T>(),
            });
        }

        self.bind::<T>(queue_name);
        self.consumers_by_queue
            .insert(queue_name.clone(), type_name::<T>());
        Ok(())
    }

    /// Queue the sender for message type `T` writes to
    pub fn sender_queue<T: 'static>(&self) -> Option<&QueueName> {
        self.senders_by_type.get(&TypeId::of::<T>())
    }

    pub fn has_consumer(&self, queue_name: &QueueName) -> bool {
        self.consumers_by_queue.contains_key(queue_name)
    }

    /// Every queue with at least one registration, sorted by name
    pub fn queue_names(&self) -> Vec<&QueueName> {
        let mut names: Vec<&QueueName> = self.queue_types.keys().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    fn check_binding<T: 'static>(
        &self,
        queue_name: &QueueName,
        role: RegistrationRole,
    ) -> Result<(), QueueError> {
        match self.queue_types.get(queue_name) {
            Some(binding) if binding.type_id != TypeId::of::<T>() => {
                debug!(
                    queue_name = %queue_name,
                    bound_type = binding.type_name,
                    requested_type = type_name::<T>(),
                    "Queue already carries another message type"
                );
                Err(QueueError::RegistrationConflict {
                    role,
                    queue_name: queue_name.to_string(),
                    message_type: type_name::<T>(),
                })
            }
            _ => Ok(()),
        }
    }

    fn bind<T: 'static>(&mut self, queue_name: &QueueName) {
        self.queue_types
            .entry(queue_name.clone())
            .or_insert_with(|| Binding {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            });
    }
}

// ============================================================================
// Deferred Registrations
// ============================================================================

#[derive(Clone)]
enum Backend {
    InMemory(Arc<DeliveryQueue>),
    Transport(Arc<dyn Transport>),
}

struct BuildContext {
    backend: Backend,
    retry_options: RetryOptions,
    tracking: Option<Arc<TrackingService>>,
    queue_settings: BTreeMap<String, QueueEntrySettings>,
}

impl BuildContext {
    fn queue_entry(&self, queue_name: &QueueName) -> Option<&QueueEntrySettings> {
        self.queue_settings.get(queue_name.as_str())
    }
}

type ErasedSender = Box<dyn Any + Send + Sync>;
type PendingSender = Box<dyn FnOnce(&BuildContext) -> (TypeId, ErasedSender) + Send>;
type PendingConsumer =
    Box<dyn FnOnce(&BuildContext) -> Result<Box<dyn ConsumerStarter>, QueueError> + Send>;

/// A built consumer waiting for the system to start
#[async_trait]
trait ConsumerStarter: Send + Sync {
    fn queue_name(&self) -> &QueueName;

    /// Start consuming; `None` when the queue turned out to be unusable
    async fn start(self: Box<Self>, cancel: CancellationToken)
        -> Result<Option<JoinHandle<()>>, QueueError>;
}

struct LoopStarter<T> {
    consumer_loop: ConsumerLoop<T>,
}

#[async_trait]
impl<T: Payload> ConsumerStarter for LoopStarter<T> {
    fn queue_name(&self) -> &QueueName {
        self.consumer_loop.queue_name()
    }

    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, QueueError> {
        Ok(Some(self.consumer_loop.spawn(cancel)))
    }
}

struct SubscriptionStarter<T> {
    consumer: Arc<TransportConsumer<T>>,
    options: SubscribeOptions,
}

#[async_trait]
impl<T> ConsumerStarter for SubscriptionStarter<T>
where
    T: Payload + Serialize + DeserializeOwned,
{
    fn queue_name(&self) -> &QueueName {
        self.consumer.queue_name()
    }

    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, QueueError> {
        let Some(subscription) = self.consumer.clone().start(self.options).await? else {
            return Ok(None);
        };

        Ok(Some(tokio::spawn(async move {
            cancel.cancelled().await;
            subscription.close().await;
        })))
    }
}

// ============================================================================
// QueueSystemBuilder
// ============================================================================

/// Fluent configuration of senders, consumers and tracking.
///
/// Per-queue entries from [`QueueSettings`] override the retry delays and
/// consumer options given in code for the same queue.
pub struct QueueSystemBuilder {
    backend: Backend,
    retry_options: RetryOptions,
    tracking_capacity: Option<usize>,
    poll_interval: Duration,
    queue_settings: BTreeMap<String, QueueEntrySettings>,
    registry: QueueRegistry,
    senders: Vec<PendingSender>,
    consumers: Vec<PendingConsumer>,
}

impl QueueSystemBuilder {
    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            retry_options: RetryOptions::default(),
            tracking_capacity: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_settings: BTreeMap::new(),
            registry: QueueRegistry::new(),
            senders: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Use the in-process broker
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::InMemory(Arc::new(DeliveryQueue::new())))
    }

    /// Use an external transport
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::with_backend(Backend::Transport(transport))
    }

    /// In-process broker configured from `settings`
    pub fn from_settings(settings: &QueueSettings) -> Result<Self, QueueError> {
        Self::in_memory().with_settings(settings)
    }

    /// Apply validated settings: retry switch, tracking, poll interval and
    /// per-queue overrides
    pub fn with_settings(mut self, settings: &QueueSettings) -> Result<Self, QueueError> {
        settings.validate()?;

        self.retry_options = settings.retry_options();
        self.tracking_capacity = settings
            .tracking
            .enabled
            .then_some(settings.tracking.maximum_messages_per_queue);
        self.poll_interval = settings.monitor.poll_interval();
        self.queue_settings = settings.queues.clone();
        Ok(self)
    }

    /// Ignore every retry schedule; the first failure of any message faults it
    pub fn disable_retry_policy(mut self) -> Self {
        self.retry_options = RetryOptions::disabled();
        self
    }

    /// Record sent, received and faulted payloads, keeping at most `capacity`
    /// per queue and kind
    pub fn add_message_tracker(mut self, capacity: usize) -> Result<Self, QueueError> {
        if capacity < 1 {
            return Err(ConfigurationError::Invalid {
                message: "maximum messages per queue must be at least 1".to_string(),
            }
            .into());
        }
        self.tracking_capacity = Some(capacity);
        Ok(self)
    }

    pub fn with_monitor_poll_interval(mut self, poll_interval: Duration) -> Result<Self, QueueError> {
        if poll_interval.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "monitor poll interval must be positive".to_string(),
            }
            .into());
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    /// Register the sender for message type `T`
    pub fn add_sender<T>(
        mut self,
        queue_name: QueueName,
        retry_delays: impl IntoIterator<Item = Duration>,
    ) -> Result<Self, QueueError>
    where
        T: Payload + Serialize + DeserializeOwned,
    {
        self.registry.register_sender::<T>(&queue_name)?;
        let retry_delays: Vec<Duration> = retry_delays.into_iter().collect();

        self.senders.push(Box::new(move |ctx: &BuildContext| {
            let registered = ctx
                .queue_entry(&queue_name)
                .map(QueueEntrySettings::retry_delays)
                .unwrap_or(retry_delays);
            let delays = ctx.retry_options.effective_delays(&registered);

            let sender: Arc<dyn QueueSender<T>> = match &ctx.backend {
                Backend::InMemory(delivery) => Arc::new(InMemorySender::new(
                    queue_name,
                    delivery.clone(),
                    delays,
                    ctx.tracking.clone(),
                )),
                Backend::Transport(transport) => Arc::new(TransportSender::new(
                    queue_name,
                    transport.clone(),
                    delays,
                    ctx.tracking.clone(),
                )),
            };
            let erased: ErasedSender = Box::new(sender);
            (TypeId::of::<T>(), erased)
        }));

        Ok(self)
    }

    /// Register the consumer for `queue_name` with default options
    pub fn add_consumer<T, F>(self, queue_name: QueueName, factory: F) -> Result<Self, QueueError>
    where
        T: Payload + Serialize + DeserializeOwned,
        F: ConsumerFactory<T> + 'static,
    {
        self.add_consumer_with_options(queue_name, factory, ConsumerOptions::default())
    }

    /// Register the consumer for `queue_name`
    pub fn add_consumer_with_options<T, F>(
        mut self,
        queue_name: QueueName,
        factory: F,
        options: ConsumerOptions,
    ) -> Result<Self, QueueError>
    where
        T: Payload + Serialize + DeserializeOwned,
        F: ConsumerFactory<T> + 'static,
    {
        self.registry.register_consumer::<T>(&queue_name)?;
        let factory: Arc<dyn ConsumerFactory<T>> = Arc::new(factory);

        self.consumers.push(Box::new(move |ctx: &BuildContext| {
            let options = ctx
                .queue_entry(&queue_name)
                .map(QueueEntrySettings::consumer_options)
                .unwrap_or(options);
            let dispatcher = Dispatcher::new(queue_name.clone(), factory, ctx.tracking.clone());

            let starter: Box<dyn ConsumerStarter> = match &ctx.backend {
                Backend::InMemory(delivery) => Box::new(LoopStarter {
                    consumer_loop: ConsumerLoop::new(delivery.store::<T>(&queue_name)?, dispatcher),
                }),
                Backend::Transport(transport) => Box::new(SubscriptionStarter {
                    consumer: Arc::new(TransportConsumer::new(transport.clone(), dispatcher)),
                    options: options.into(),
                }),
            };
            Ok(starter)
        }));

        Ok(self)
    }

    /// Register both sides of `queue_name` for message type `T`
    pub fn add_sender_and_consumer<T, F>(
        self,
        queue_name: QueueName,
        retry_delays: impl IntoIterator<Item = Duration>,
        factory: F,
    ) -> Result<Self, QueueError>
    where
        T: Payload + Serialize + DeserializeOwned,
        F: ConsumerFactory<T> + 'static,
    {
        self.add_sender::<T>(queue_name.clone(), retry_delays)?
            .add_consumer::<T, F>(queue_name, factory)
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Build the system; consumers are created but not started
    pub fn build(self) -> Result<QueueSystem, QueueError> {
        let tracking = self
            .tracking_capacity
            .map(TrackingService::new)
            .transpose()?
            .map(Arc::new);

        let ctx = BuildContext {
            backend: self.backend,
            retry_options: self.retry_options,
            tracking: tracking.clone(),
            queue_settings: self.queue_settings,
        };

        let senders = self.senders.into_iter().map(|pending| pending(&ctx)).collect();
        let consumers = self
            .consumers
            .into_iter()
            .map(|pending| pending(&ctx))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            queues = self.registry.queue_names().len(),
            consumers = consumers.len(),
            retries_enabled = ctx.retry_options.allow_retries,
            tracking_enabled = tracking.is_some(),
            "Queue system built"
        );

        Ok(QueueSystem {
            registry: self.registry,
            senders,
            consumers: Mutex::new(consumers),
            started: AtomicBool::new(false),
            tracking,
            poll_interval: self.poll_interval,
        })
    }
}

// ============================================================================
// QueueSystem
// ============================================================================

/// A configured set of senders and consumers
pub struct QueueSystem {
    registry: QueueRegistry,
    senders: HashMap<TypeId, ErasedSender>,
    consumers: Mutex<Vec<Box<dyn ConsumerStarter>>>,
    started: AtomicBool,
    tracking: Option<Arc<TrackingService>>,
    poll_interval: Duration,
}

impl QueueSystem {
    pub fn builder() -> QueueSystemBuilder {
        QueueSystemBuilder::in_memory()
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Sender registered for message type `T`
    pub fn sender<T: Payload>(&self) -> Result<Arc<dyn QueueSender<T>>, QueueError> {
        self.senders
            .get(&TypeId::of::<T>())
            .and_then(|erased| erased.downcast_ref::<Arc<dyn QueueSender<T>>>())
            .cloned()
            .ok_or(QueueError::SenderNotRegistered {
                message_type: type_name::<T>(),
            })
    }

    /// Send `payload` through the sender registered for its type
    pub async fn send<T: Payload>(&self, payload: T) -> Result<MessageId, QueueError> {
        self.send_delayed(payload, Duration::ZERO).await
    }

    pub async fn send_delayed<T: Payload>(
        &self,
        payload: T,
        initial_delay: Duration,
    ) -> Result<MessageId, QueueError> {
        self.sender::<T>()?.send(payload, initial_delay).await
    }

    pub fn tracking(&self) -> Option<&Arc<TrackingService>> {
        self.tracking.as_ref()
    }

    /// Monitor over this system's tracker; fails when tracking is disabled
    pub fn monitor(&self) -> Result<QueueMonitor, QueueError> {
        let tracking = self.tracking.clone().ok_or(ConfigurationError::Invalid {
            message: "message tracking is not enabled".to_string(),
        })?;
        QueueMonitor::new(tracking).with_poll_interval(self.poll_interval)
    }

    /// Start every registered consumer.
    ///
    /// Consumers on unusable transport queues are skipped. Can be called once.
    pub async fn start(&self, cancel: CancellationToken) -> Result<RunningQueueSystem, QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        let starters = std::mem::take(
            &mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut tasks = Vec::with_capacity(starters.len());
        for starter in starters {
            let queue_name = starter.queue_name().clone();
            match starter.start(cancel.clone()).await {
                Ok(Some(task)) => tasks.push((queue_name, task)),
                Ok(None) => {}
                Err(e) => {
                    cancel.cancel();
                    stop_all(tasks).await;
                    return Err(e);
                }
            }
        }

        info!(consumers = tasks.len(), "Queue system started");
        Ok(RunningQueueSystem { cancel, tasks })
    }
}

// ============================================================================
// RunningQueueSystem
// ============================================================================

/// Handle to started consumers
#[derive(Debug)]
pub struct RunningQueueSystem {
    cancel: CancellationToken,
    tasks: Vec<(QueueName, JoinHandle<()>)>,
}

impl RunningQueueSystem {
    /// Number of consumers actually running
    pub fn consumer_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every consumer and wait for in-flight messages to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        stop_all(self.tasks).await;
        info!("Queue system stopped");
    }
}

async fn stop_all(tasks: Vec<(QueueName, JoinHandle<()>)>) {
    for (queue_name, task) in tasks {
        if let Err(e) = task.await {
            error!(queue_name = %queue_name, error = %e, "Consumer task failed");
        }
    }
}
