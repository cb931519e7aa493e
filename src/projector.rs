//! Checkpointed event consumers over the global log.
//!
//! An [`EventProjector`] runs named consumers. Each consumer subscribes
//! typed handlers, then drives a background loop that replays the log from
//! its last checkpoint, dispatches every event to the matching handlers in
//! log order, and records the position after each event. Catch-up flows
//! into live tailing without a gap, and a consumer resumes strictly after
//! its checkpoint on restart.
//!
//! Delivery is at-least-once: a crash between dispatch and checkpoint write
//! replays the last event, so handlers must tolerate redelivery. What
//! happens when a handler keeps failing is an explicit choice, not a
//! default -- see [`FailurePolicy`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, validate_consumer_name};
use crate::correlation::CorrelationContext;
use crate::error::{BoxedError, ProjectorError, StoreError};
use crate::event::{DomainEvent, StoredEvent, decode_event};
use crate::store::{EventStore, EventStream, SubscriptionItem, unix_timestamp_millis};

/// What a consumer loop does when a handler exhausts its chances.
///
/// Both policies keep per-consumer ordering intact; they differ in whether
/// a poisoned event may be left behind.
#[derive(Debug, Clone)]
pub enum FailurePolicy {
    /// Stop the consumer without advancing its checkpoint.
    ///
    /// The failed event is redelivered on the next start, so nothing is
    /// skipped -- at the cost of the consumer staying stuck until the
    /// handler (or the event) is fixed. [`stop`](EventProjector::stop)
    /// returns the [`ProjectorError::Handler`] that stopped the loop.
    Block,

    /// Retry with exponential backoff, then dead-letter and move on.
    ///
    /// After the final attempt the event is appended to a JSONL file as a
    /// [`DeadLetterEntry`] and the checkpoint advances past it. The
    /// consumer keeps processing; skipped events are replayed by hand from
    /// the dead-letter file once the cause is fixed.
    RetryThenDeadLetter {
        /// Total attempts per handler, first try included. Treated as 1
        /// when 0.
        max_attempts: u32,
        /// Delay before the second attempt; doubled per retry.
        base_delay: Duration,
        /// Upper bound for the retry delay.
        max_delay: Duration,
        /// JSONL file the exhausted events are appended to.
        dead_letter_path: PathBuf,
    },
}

impl FailurePolicy {
    /// [`RetryThenDeadLetter`](Self::RetryThenDeadLetter) with the stock
    /// tuning: 5 attempts, 100ms base delay, 5s cap.
    pub fn retry_then_dead_letter(dead_letter_path: impl Into<PathBuf>) -> Self {
        Self::RetryThenDeadLetter {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            dead_letter_path: dead_letter_path.into(),
        }
    }
}

/// Tuning for consumer loops.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use causeway_es::ProjectorConfig;
///
/// let config = ProjectorConfig {
///     reconnect_base_delay: Duration::from_millis(250),
///     ..ProjectorConfig::default()
/// };
/// assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Failure handling for all consumers of this projector.
    ///
    /// Default: [`FailurePolicy::Block`]. Skipping an event must be opted
    /// into, never stumbled into.
    pub failure_policy: FailurePolicy,

    /// Delay before the first resubscribe after a lost subscription;
    /// doubled per consecutive failure.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Upper bound for the resubscribe delay.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Block,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Envelope metadata handed to a handler alongside the decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    /// Stream the event belongs to.
    pub stream_id: Uuid,
    /// Zero-based version within that stream.
    pub version: u64,
    /// Global log position.
    pub position: u64,
    /// Identity chain stamped when the event was raised. Commands issued
    /// in reaction to the event should derive their context from this one.
    pub correlation: CorrelationContext,
}

/// One line of a dead-letter file: an event a consumer gave up on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Consumer that exhausted its attempts.
    pub consumer: String,
    /// The event as it was read from the log.
    pub event: StoredEvent,
    /// Display rendering of the final handler error.
    pub error: String,
    /// How many attempts were made.
    pub attempts: u32,
    /// Milliseconds since the Unix epoch when the entry was written.
    pub dead_lettered_at: u64,
}

fn append_dead_letter(path: &Path, entry: &DeadLetterEntry) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry).map_err(io::Error::other)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// A typed handler erased to operate on raw stored events.
///
/// Decoding happens inside, so a payload that no longer matches its type
/// flows through the same failure path as a handler error.
type ErasedHandler = Arc<
    dyn Fn(StoredEvent) -> Pin<Box<dyn Future<Output = Result<(), BoxedError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Registration {
    /// Wire tags this handler's event type decodes.
    tags: &'static [&'static str],
    handler: ErasedHandler,
}

/// Control channels for one running consumer loop.
struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    caught_up: Arc<AtomicBool>,
    task: JoinHandle<Result<(), ProjectorError>>,
}

#[derive(Default)]
struct ConsumerState {
    registrations: Vec<Registration>,
    handle: Option<ConsumerHandle>,
}

/// Runs named, checkpointed consumers against an event store.
///
/// Register handlers with [`subscribe`](Self::subscribe), then
/// [`start`](Self::start) each consumer. Every consumer gets its own
/// background loop, its own checkpoint, and strict in-order dispatch; two
/// consumers never wait on each other.
///
/// Dropping the projector signals its loops to finish their in-flight
/// event and exit; call [`stop`](Self::stop) instead when the loop's
/// result matters.
pub struct EventProjector<S, C> {
    store: S,
    checkpoints: C,
    config: ProjectorConfig,
    consumers: HashMap<String, ConsumerState>,
}

// Handlers are type-erased closures, so Debug lists the consumers rather
// than deriving over the whole struct.
impl<S, C> fmt::Debug for EventProjector<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut consumers: Vec<&str> = self.consumers.keys().map(String::as_str).collect();
        consumers.sort_unstable();
        f.debug_struct("EventProjector")
            .field("consumers", &consumers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, C> EventProjector<S, C>
where
    S: EventStore + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    /// Create a projector with the default [`ProjectorConfig`].
    pub fn new(store: S, checkpoints: C) -> Self {
        Self::with_config(store, checkpoints, ProjectorConfig::default())
    }

    /// Create a projector with explicit tuning.
    pub fn with_config(store: S, checkpoints: C, config: ProjectorConfig) -> Self {
        Self {
            store,
            checkpoints,
            config,
            consumers: HashMap::new(),
        }
    }

    /// Register a typed handler under `consumer`.
    ///
    /// The handler runs for every event whose wire tag appears in
    /// `E::TYPES`, in log order, one event at a time. Subscribing several
    /// handlers under the same consumer fans each event out to every
    /// handler whose type covers its tag, in registration order; the
    /// consumer's checkpoint advances only once all of them have accepted
    /// the event.
    ///
    /// Handlers must be idempotent: delivery is at-least-once.
    pub fn subscribe<E, F, Fut>(&mut self, consumer: &str, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(E, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |event: StoredEvent| {
            let context = EventContext {
                stream_id: event.stream_id,
                version: event.version,
                position: event.position,
                correlation: event.context,
            };
            let future: Pin<Box<dyn Future<Output = Result<(), BoxedError>> + Send>> =
                match decode_event::<E>(&event) {
                    Ok(decoded) => Box::pin(handler(decoded, context)),
                    Err(e) => Box::pin(std::future::ready(Err(Box::new(e) as BoxedError))),
                };
            future
        });
        let state = self.consumers.entry(consumer.to_owned()).or_default();
        state.registrations.push(Registration {
            tags: E::TYPES,
            handler: erased,
        });
        self
    }

    /// Start the background loop for `consumer`.
    ///
    /// The loop reads the consumer's checkpoint, replays the log strictly
    /// after it, and keeps tailing live events until stopped. A consumer
    /// whose loop has already exited (for example under
    /// [`FailurePolicy::Block`]) still counts as started until
    /// [`stop`](Self::stop) collects its result.
    ///
    /// # Errors
    ///
    /// * [`ProjectorError::UnknownConsumer`] if nothing was subscribed
    ///   under this name.
    /// * [`ProjectorError::AlreadyRunning`] if the consumer was started
    ///   and not yet stopped.
    /// * [`ProjectorError::Checkpoint`] if the consumer name is empty.
    pub fn start(&mut self, consumer: &str) -> Result<(), ProjectorError> {
        validate_consumer_name(consumer)?;
        let state = self
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| ProjectorError::UnknownConsumer(consumer.to_owned()))?;
        if state.handle.is_some() {
            return Err(ProjectorError::AlreadyRunning(consumer.to_owned()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let caught_up = Arc::new(AtomicBool::new(false));
        let worker = ConsumerWorker {
            consumer: consumer.to_owned(),
            store: self.store.clone(),
            checkpoints: self.checkpoints.clone(),
            registrations: state.registrations.clone(),
            config: self.config.clone(),
            caught_up: Arc::clone(&caught_up),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));
        state.handle = Some(ConsumerHandle {
            shutdown_tx,
            caught_up,
            task,
        });
        Ok(())
    }

    /// Stop `consumer` and return its loop's result.
    ///
    /// The loop finishes the event it is dispatching -- checkpoint write
    /// included -- before exiting, so stopping never tears an event in
    /// half. If the loop already exited on its own, its stored result is
    /// returned here.
    ///
    /// # Errors
    ///
    /// * [`ProjectorError::UnknownConsumer`] if nothing was subscribed
    ///   under this name.
    /// * [`ProjectorError::NotRunning`] if the consumer was never started
    ///   or already stopped.
    /// * [`ProjectorError::TaskPanicked`] if the loop task panicked.
    /// * Whatever error ended the loop, typically
    ///   [`ProjectorError::Handler`] under [`FailurePolicy::Block`].
    pub async fn stop(&mut self, consumer: &str) -> Result<(), ProjectorError> {
        let state = self
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| ProjectorError::UnknownConsumer(consumer.to_owned()))?;
        let Some(handle) = state.handle.take() else {
            return Err(ProjectorError::NotRunning(consumer.to_owned()));
        };
        // The receiver is gone if the loop already exited; that is fine.
        let _ = handle.shutdown_tx.send(true);
        match handle.task.await {
            Ok(result) => result,
            Err(_) => Err(ProjectorError::TaskPanicked),
        }
    }

    /// Whether `consumer`'s loop task is currently executing.
    pub fn is_running(&self, consumer: &str) -> bool {
        self.consumers
            .get(consumer)
            .and_then(|state| state.handle.as_ref())
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Whether `consumer` has drained the historical log at least once and
    /// is tailing live events.
    pub fn is_caught_up(&self, consumer: &str) -> bool {
        self.consumers
            .get(consumer)
            .and_then(|state| state.handle.as_ref())
            .is_some_and(|handle| handle.caught_up.load(Ordering::Acquire))
    }
}

/// Outcome of draining one subscription, for the resubscribe loop.
enum StreamOutcome {
    /// Shutdown was signalled; the loop exits cleanly.
    Shutdown,
    /// The stream ended; treated as transient, resubscribe right away.
    Ended,
    /// The subscription failed; resubscribe after backoff.
    Lost(StoreError),
}

/// Everything one consumer loop owns, moved into its spawned task.
struct ConsumerWorker<S, C> {
    consumer: String,
    store: S,
    checkpoints: C,
    registrations: Vec<Registration>,
    config: ProjectorConfig,
    caught_up: Arc<AtomicBool>,
}

impl<S, C> ConsumerWorker<S, C>
where
    S: EventStore + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ProjectorError> {
        let mut backoff_delay = self.config.reconnect_base_delay;
        let mut last_processed = self.checkpoints.get_checkpoint(&self.consumer).await?;

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let from_position = last_processed.map_or(0, |position| position + 1);
            tracing::debug!(
                consumer = %self.consumer,
                from_position,
                "subscribing to the event log"
            );
            let mut stream = self.store.subscribe_all(from_position);

            let outcome = self
                .drain_stream(&mut stream, &mut last_processed, &mut shutdown_rx)
                .await?;
            match outcome {
                StreamOutcome::Shutdown => return Ok(()),
                StreamOutcome::Ended => {
                    tracing::debug!(consumer = %self.consumer, "subscription ended, resubscribing");
                    backoff_delay = self.config.reconnect_base_delay;
                }
                StreamOutcome::Lost(error) => {
                    tracing::warn!(
                        consumer = %self.consumer,
                        error = %error,
                        "subscription lost, resubscribing after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff_delay) => {}
                        _ = shutdown_rx.changed() => return Ok(()),
                    }
                    backoff_delay = (backoff_delay * 2).min(self.config.reconnect_max_delay);
                }
            }
        }
    }

    /// Consume one subscription until it ends, fails, or shutdown is
    /// signalled.
    ///
    /// Event processing happens outside the `select!`, so shutdown can
    /// interrupt the wait for the next event but never an event that is
    /// already being dispatched.
    async fn drain_stream(
        &self,
        stream: &mut EventStream,
        last_processed: &mut Option<u64>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<StreamOutcome, ProjectorError> {
        loop {
            let item = tokio::select! {
                _ = shutdown_rx.changed() => return Ok(StreamOutcome::Shutdown),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                return Ok(StreamOutcome::Ended);
            };
            match item {
                Ok(SubscriptionItem::Event(event)) => {
                    // At-least-once delivery: anything at or below the
                    // cursor was already handled in a previous pass.
                    if last_processed.is_some_and(|last| event.position <= last) {
                        continue;
                    }
                    let position = event.position;
                    self.process_event(event).await?;
                    self.checkpoints
                        .store_checkpoint(&self.consumer, position)
                        .await?;
                    *last_processed = Some(position);
                }
                Ok(SubscriptionItem::CaughtUp) => {
                    self.caught_up.store(true, Ordering::Release);
                    tracing::debug!(consumer = %self.consumer, "caught up with the event log");
                }
                Err(error) => return Ok(StreamOutcome::Lost(error)),
            }
        }
    }

    /// Dispatch one event to every registration covering its tag.
    ///
    /// An event whose tag no handler covers still advances the checkpoint;
    /// a consumer only tracks the types it subscribed.
    async fn process_event(&self, event: StoredEvent) -> Result<(), ProjectorError> {
        for registration in &self.registrations {
            if !registration.tags.contains(&event.event_type.as_str()) {
                continue;
            }
            self.run_handler(registration, &event).await?;
        }
        Ok(())
    }

    async fn run_handler(
        &self,
        registration: &Registration,
        event: &StoredEvent,
    ) -> Result<(), ProjectorError> {
        match &self.config.failure_policy {
            FailurePolicy::Block => match (registration.handler)(event.clone()).await {
                Ok(()) => Ok(()),
                Err(source) => {
                    tracing::error!(
                        consumer = %self.consumer,
                        event_type = %event.event_type,
                        position = event.position,
                        error = %source,
                        "handler failed, consumer stops at this event"
                    );
                    Err(ProjectorError::Handler {
                        consumer: self.consumer.clone(),
                        event_type: event.event_type.clone(),
                        position: event.position,
                        source,
                    })
                }
            },
            FailurePolicy::RetryThenDeadLetter {
                max_attempts,
                base_delay,
                max_delay,
                dead_letter_path,
            } => {
                let mut delay = *base_delay;
                let mut attempt = 1u32;
                loop {
                    match (registration.handler)(event.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(error) if attempt < *max_attempts => {
                            tracing::warn!(
                                consumer = %self.consumer,
                                event_type = %event.event_type,
                                position = event.position,
                                attempt,
                                error = %error,
                                "handler failed, retrying"
                            );
                            // Retries belong to the in-flight event, so
                            // this sleep is not raced against shutdown.
                            tokio::time::sleep(delay).await;
                            delay = (delay * 2).min(*max_delay);
                            attempt += 1;
                        }
                        Err(error) => {
                            tracing::error!(
                                consumer = %self.consumer,
                                event_type = %event.event_type,
                                position = event.position,
                                attempts = attempt,
                                error = %error,
                                "handler failed on the final attempt, dead-lettering"
                            );
                            let entry = DeadLetterEntry {
                                consumer: self.consumer.clone(),
                                event: event.clone(),
                                error: error.to_string(),
                                attempts: attempt,
                                dead_lettered_at: unix_timestamp_millis(),
                            };
                            append_dead_letter(dead_letter_path, &entry)
                                .map_err(ProjectorError::DeadLetter)?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
