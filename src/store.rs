//! The event store contract and the in-memory reference implementation.
//!
//! [`EventStore`] is the persistence seam the rest of the crate is written
//! against: a global append-only log of streams with optimistic
//! compare-and-append, bounded stream reads, and a catch-up-then-live
//! subscription. [`InMemoryEventStore`] implements it over a mutex-guarded
//! log plus a `tokio::sync::broadcast` channel and is the backbone of every
//! test in the crate; durable backends implement the same trait out of tree.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent};

/// Default capacity of the live fan-out buffer.
const DEFAULT_LIVE_BUFFER: usize = 1024;

/// Expected-version precondition for appends and stream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Any version is acceptable; no concurrency check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream whose last version is `current` (`None` if the
    /// stream does not exist) satisfies this precondition.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::Exact(version) => current == Some(version),
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any version"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::Exact(version) => write!(f, "version {version}"),
        }
    }
}

/// Item yielded by [`EventStore::subscribe_all`].
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    /// A recorded event, in ascending global-position order.
    Event(StoredEvent),
    /// Historical replay is complete; subsequent items are live.
    CaughtUp,
}

/// A pinned, boxed subscription stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SubscriptionItem, StoreError>> + Send>>;

/// Abstract append-only event store.
///
/// # Contract
///
/// * Streams are independent sequences with zero-based versions; the global
///   log assigns every event a zero-based position that never changes, even
///   across stream deletion.
/// * `append_to_stream` is the only write path and is atomic: the
///   precondition check and the append happen as one step, which is the
///   entire concurrency story of the crate.
/// * `subscribe_all` delivers history from the requested position, then a
///   single [`SubscriptionItem::CaughtUp`] marker, then live events, in
///   ascending position order with no gaps. Delivery is at-least-once;
///   consumers deduplicate by position.
pub trait EventStore: Send + Sync {
    /// Append `events` to `stream_id` if `expected` matches the stream's
    /// current last version.
    ///
    /// # Returns
    ///
    /// The version of the last event appended.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionConflict`] if the precondition fails,
    /// [`StoreError::EmptyAppend`] if `events` is empty.
    fn append_to_stream(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Read one stream's events with versions in `from_version..=to_version`.
    ///
    /// An absent stream reads as an empty history; absence is not an error
    /// on the read path.
    fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
        to_version: u64,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send;

    /// Read the global log from `from_position` (inclusive) to its head.
    fn read_all_from(
        &self,
        from_position: u64,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send;

    /// Physically remove a stream if `expected` matches its current last
    /// version.
    ///
    /// # Errors
    ///
    /// [`StoreError::StreamNotFound`] if the stream does not exist,
    /// [`StoreError::VersionConflict`] if the precondition fails.
    fn delete_stream(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to the global log from `from_position` (inclusive).
    ///
    /// See the trait-level contract for the delivery guarantees.
    fn subscribe_all(&self, from_position: u64) -> EventStream;
}

/// In-memory [`EventStore`] backed by a mutex-guarded log.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped, and clones share
/// the same log behind the same lock.
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    state: Mutex<LogState>,
    live: broadcast::Sender<StoredEvent>,
}

#[derive(Debug, Default)]
struct LogState {
    /// Global log. Hard-deleted events leave `None` holes so the positions
    /// of surviving events never move.
    log: Vec<Option<StoredEvent>>,
    /// Per-stream event positions, indexed by stream version.
    streams: HashMap<Uuid, Vec<u64>>,
}

impl LogState {
    fn current_version(&self, stream_id: &Uuid) -> Option<u64> {
        self.streams
            .get(stream_id)
            .and_then(|positions| positions.len().checked_sub(1))
            .map(|version| version as u64)
    }
}

impl InMemoryEventStore {
    /// Create a store with the default live fan-out buffer.
    pub fn new() -> Self {
        Self::with_live_buffer(DEFAULT_LIVE_BUFFER)
    }

    /// Create a store with a live fan-out buffer of `capacity` events.
    ///
    /// A subscriber that falls more than `capacity` events behind the head
    /// receives [`StoreError::SubscriptionLagged`] and is expected to
    /// resubscribe from its checkpoint.
    pub fn with_live_buffer(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(LogState::default()),
                live,
            }),
        }
    }

    /// Number of events ever appended (holes included); the next position.
    pub fn head_position(&self) -> u64 {
        self.lock_state().log.len() as u64
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        // A poisoned lock means a panic mid-append in another test thread;
        // the log itself is still structurally valid.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    async fn append_to_stream(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyAppend);
        }
        let recorded_at = unix_timestamp_millis();

        let mut state = self.lock_state();
        let current = state.current_version(&stream_id);
        if !expected.matches(current) {
            return Err(StoreError::VersionConflict {
                stream_id,
                expected,
                actual: current,
            });
        }

        let mut version = current.map_or(0, |v| v + 1);
        let mut last_version = version;
        for event in events {
            let position = state.log.len() as u64;
            let stored = StoredEvent {
                stream_id,
                version,
                position,
                event_type: event.event_type,
                payload: event.payload,
                context: event.context,
                recorded_at,
            };
            state.log.push(Some(stored.clone()));
            state.streams.entry(stream_id).or_default().push(position);
            // Publish while still holding the lock so live delivery order
            // matches log order across concurrent appends. Send errors mean
            // no subscribers, which is fine.
            let _ = self.inner.live.send(stored);
            last_version = version;
            version += 1;
        }
        Ok(last_version)
    }

    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.lock_state();
        let Some(positions) = state.streams.get(&stream_id) else {
            return Ok(Vec::new());
        };
        let start = from_version.min(positions.len() as u64) as usize;
        let end = positions
            .len()
            .min(to_version.saturating_add(1).min(usize::MAX as u64) as usize);
        if start >= end {
            return Ok(Vec::new());
        }
        let events = positions[start..end]
            .iter()
            .filter_map(|&position| state.log[position as usize].clone())
            .collect();
        Ok(events)
    }

    async fn read_all_from(&self, from_position: u64) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.lock_state();
        let start = from_position.min(state.log.len() as u64) as usize;
        Ok(state.log[start..].iter().flatten().cloned().collect())
    }

    async fn delete_stream(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if !state.streams.contains_key(&stream_id) {
            return Err(StoreError::StreamNotFound(stream_id));
        }
        let current = state.current_version(&stream_id);
        if !expected.matches(current) {
            return Err(StoreError::VersionConflict {
                stream_id,
                expected,
                actual: current,
            });
        }
        if let Some(positions) = state.streams.remove(&stream_id) {
            for position in positions {
                state.log[position as usize] = None;
            }
        }
        Ok(())
    }

    fn subscribe_all(&self, from_position: u64) -> EventStream {
        let (history, live_rx, live_threshold) = {
            let state = self.lock_state();
            let start = from_position.min(state.log.len() as u64) as usize;
            let history: Vec<StoredEvent> = state.log[start..].iter().flatten().cloned().collect();
            // Register for live events under the same lock as the history
            // snapshot so nothing can slip between catch-up and live.
            let live_rx = self.inner.live.subscribe();
            let live_threshold = (state.log.len() as u64).max(from_position);
            (history, live_rx, live_threshold)
        };

        let catch_up =
            tokio_stream::iter(history).map(|event| Ok(SubscriptionItem::Event(event)));
        let marker = tokio_stream::once(Ok(SubscriptionItem::CaughtUp));
        let live = BroadcastStream::new(live_rx).filter_map(move |item| match item {
            // Events below the threshold were already in the snapshot.
            Ok(event) if event.position >= live_threshold => {
                Some(Ok(SubscriptionItem::Event(event)))
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Some(Err(StoreError::SubscriptionLagged { missed }))
            }
        });

        Box::pin(catch_up.chain(marker).chain(live))
    }
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationContext;
    use serde_json::json;

    fn proposed(tag: &str, amount: i64) -> ProposedEvent {
        ProposedEvent {
            event_type: tag.to_owned(),
            payload: json!({ "type": tag, "data": { "amount": amount } }),
            context: CorrelationContext::origin(),
        }
    }

    async fn next_item(stream: &mut EventStream) -> SubscriptionItem {
        stream
            .next()
            .await
            .expect("stream should yield an item")
            .expect("item should not be an error")
    }

    // --- append tests ---

    #[tokio::test]
    async fn append_assigns_stream_versions_and_global_positions() {
        let store = InMemoryEventStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let last = store
            .append_to_stream(a, ExpectedVersion::NoStream, vec![proposed("E", 1), proposed("E", 2)])
            .await
            .expect("first append should succeed");
        assert_eq!(last, 1);

        store
            .append_to_stream(b, ExpectedVersion::NoStream, vec![proposed("E", 3)])
            .await
            .expect("append to a second stream should succeed");

        let last = store
            .append_to_stream(a, ExpectedVersion::Exact(1), vec![proposed("E", 4)])
            .await
            .expect("append at the current version should succeed");
        assert_eq!(last, 2);

        let events = store
            .read_stream(a, 0, u64::MAX)
            .await
            .expect("read should succeed");
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        let positions: Vec<u64> = events.iter().map(|e| e.position).collect();
        assert_eq!(versions, vec![0, 1, 2], "versions are per stream");
        assert_eq!(positions, vec![0, 1, 3], "positions are global");
    }

    #[tokio::test]
    async fn append_admits_exactly_one_writer_per_expected_version() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(stream, ExpectedVersion::NoStream, vec![proposed("E", 0)])
            .await
            .expect("seed append should succeed");

        let first = store
            .append_to_stream(stream, ExpectedVersion::Exact(0), vec![proposed("E", 1)])
            .await;
        let second = store
            .append_to_stream(stream, ExpectedVersion::Exact(0), vec![proposed("E", 2)])
            .await;

        assert!(first.is_ok(), "the first writer wins");
        let err = second.expect_err("the second writer must conflict");
        assert!(matches!(
            err,
            StoreError::VersionConflict { actual: Some(1), .. }
        ));
    }

    #[tokio::test]
    async fn no_stream_precondition_rejects_an_existing_stream() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(stream, ExpectedVersion::NoStream, vec![proposed("E", 0)])
            .await
            .expect("seed append should succeed");

        let err = store
            .append_to_stream(stream, ExpectedVersion::NoStream, vec![proposed("E", 1)])
            .await
            .expect_err("NoStream against an existing stream must conflict");
        assert!(matches!(
            err,
            StoreError::VersionConflict { actual: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn any_precondition_skips_the_version_check() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();

        store
            .append_to_stream(stream, ExpectedVersion::Any, vec![proposed("E", 0)])
            .await
            .expect("Any should append to a missing stream");
        store
            .append_to_stream(stream, ExpectedVersion::Any, vec![proposed("E", 1)])
            .await
            .expect("Any should append to an existing stream");
    }

    #[tokio::test]
    async fn empty_appends_are_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .append_to_stream(Uuid::new_v4(), ExpectedVersion::Any, Vec::new())
            .await
            .expect_err("an empty batch must be rejected");
        assert!(matches!(err, StoreError::EmptyAppend));
    }

    // --- read tests ---

    #[tokio::test]
    async fn read_stream_bounds_are_inclusive() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(
                stream,
                ExpectedVersion::NoStream,
                vec![proposed("E", 0), proposed("E", 1), proposed("E", 2)],
            )
            .await
            .expect("append should succeed");

        let slice = store
            .read_stream(stream, 0, 1)
            .await
            .expect("read should succeed");
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[1].version, 1);

        let tail = store
            .read_stream(stream, 1, u64::MAX)
            .await
            .expect("read should succeed");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 1);
    }

    #[tokio::test]
    async fn absent_streams_read_as_empty() {
        let store = InMemoryEventStore::new();
        let events = store
            .read_stream(Uuid::new_v4(), 0, u64::MAX)
            .await
            .expect("reading an absent stream should succeed");
        assert!(events.is_empty());
    }

    // --- delete tests ---

    #[tokio::test]
    async fn delete_requires_a_matching_version() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(stream, ExpectedVersion::NoStream, vec![proposed("E", 0), proposed("E", 1)])
            .await
            .expect("append should succeed");

        let err = store
            .delete_stream(stream, ExpectedVersion::Exact(0))
            .await
            .expect_err("a stale expected version must conflict");
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        store
            .delete_stream(stream, ExpectedVersion::Exact(1))
            .await
            .expect("deleting at the current version should succeed");
        let events = store
            .read_stream(stream, 0, u64::MAX)
            .await
            .expect("read should succeed");
        assert!(events.is_empty(), "a deleted stream reads as empty");
    }

    #[tokio::test]
    async fn deleting_an_absent_stream_is_not_found() {
        let store = InMemoryEventStore::new();
        let err = store
            .delete_stream(Uuid::new_v4(), ExpectedVersion::Any)
            .await
            .expect_err("deleting an absent stream must fail");
        assert!(matches!(err, StoreError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn hard_deletion_leaves_global_positions_stable() {
        let store = InMemoryEventStore::new();
        let doomed = Uuid::new_v4();
        let survivor = Uuid::new_v4();

        store
            .append_to_stream(doomed, ExpectedVersion::NoStream, vec![proposed("E", 0)])
            .await
            .expect("append should succeed");
        store
            .append_to_stream(survivor, ExpectedVersion::NoStream, vec![proposed("E", 1)])
            .await
            .expect("append should succeed");
        store
            .append_to_stream(doomed, ExpectedVersion::Exact(0), vec![proposed("E", 2)])
            .await
            .expect("append should succeed");
        store
            .append_to_stream(survivor, ExpectedVersion::Exact(0), vec![proposed("E", 3)])
            .await
            .expect("append should succeed");

        store
            .delete_stream(doomed, ExpectedVersion::Exact(1))
            .await
            .expect("delete should succeed");

        let all = store
            .read_all_from(0)
            .await
            .expect("read_all should succeed");
        let positions: Vec<u64> = all.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 3], "survivors keep their positions");
    }

    // --- subscription tests ---

    #[tokio::test]
    async fn subscribe_delivers_history_then_marker_then_live() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(stream, ExpectedVersion::NoStream, vec![proposed("E", 0), proposed("E", 1)])
            .await
            .expect("append should succeed");

        let mut subscription = store.subscribe_all(0);
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::Event(e) if e.position == 0
        ));
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::Event(e) if e.position == 1
        ));
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::CaughtUp
        ));

        store
            .append_to_stream(stream, ExpectedVersion::Exact(1), vec![proposed("E", 2)])
            .await
            .expect("live append should succeed");
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::Event(e) if e.position == 2
        ));
    }

    #[tokio::test]
    async fn subscribe_from_a_position_skips_earlier_history() {
        let store = InMemoryEventStore::new();
        let stream = Uuid::new_v4();
        store
            .append_to_stream(
                stream,
                ExpectedVersion::NoStream,
                vec![proposed("E", 0), proposed("E", 1), proposed("E", 2)],
            )
            .await
            .expect("append should succeed");

        let mut subscription = store.subscribe_all(2);
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::Event(e) if e.position == 2
        ));
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::CaughtUp
        ));
    }

    #[tokio::test]
    async fn lagged_subscribers_see_an_error_not_silent_loss() {
        let store = InMemoryEventStore::with_live_buffer(1);
        let stream = Uuid::new_v4();

        let mut subscription = store.subscribe_all(0);
        assert!(matches!(
            next_item(&mut subscription).await,
            SubscriptionItem::CaughtUp
        ));

        // Three live events through a one-slot buffer without polling in
        // between overflow the subscriber.
        store
            .append_to_stream(
                stream,
                ExpectedVersion::NoStream,
                vec![proposed("E", 0), proposed("E", 1), proposed("E", 2)],
            )
            .await
            .expect("append should succeed");

        let first = subscription
            .next()
            .await
            .expect("stream should yield an item");
        assert!(matches!(
            first,
            Err(StoreError::SubscriptionLagged { .. })
        ));
    }

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(9)));
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(0)));
        assert!(ExpectedVersion::Exact(3).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(3).matches(Some(4)));
        assert!(!ExpectedVersion::Exact(3).matches(None));
    }
}
