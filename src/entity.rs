//! Event-sourced entities and the record-and-apply fold.
//!
//! An entity is composed, not inherited: [`EventSourcedEntity`] owns the
//! identity, version bookkeeping, pending-event recorder, and source
//! context, while the domain state lives in an [`AggregateState`]
//! implementation that knows nothing about persistence. State is derived
//! exclusively by folding events -- there is no snapshot path -- so a
//! version-bounded fold is always available and logical deletion is just a
//! tombstone event that the fold observes.

use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::error::EntityError;
use crate::event::{DomainEvent, StoredEvent, decode_event};
use crate::recorder::{EventRecorder, PendingEvent};

/// Domain state reconstructed by folding events.
///
/// # Contract
///
/// * `Default` is the empty state before any event.
/// * `apply` must be pure, total, and deterministic: same state plus same
///   event always yields the same next state, with no I/O and no failure
///   path. Validation belongs in command handlers before
///   [`EventSourcedEntity::raise`]; by the time an event exists it is a
///   fact and must fold.
/// * `apply` receives only the domain state, so raising further events from
///   inside a fold is not expressible.
pub trait AggregateState: Default + Send + Sync + 'static {
    /// Stable name of the aggregate type (e.g. `"account"`).
    const AGGREGATE_TYPE: &'static str;

    /// The event type this state folds.
    type Event: DomainEvent;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Self::Event);

    /// Whether the folded state is logically deleted.
    ///
    /// Toggled by applying a tombstone event. The history stays fully
    /// foldable afterwards; deletion is a fact in the stream, not an
    /// erasure.
    fn is_deleted(&self) -> bool {
        false
    }
}

/// Capability for aggregates that support logical deletion.
///
/// The tombstone is an ordinary domain event; applying it must make
/// [`AggregateState::is_deleted`] return `true`.
pub trait SoftDeletable: AggregateState {
    /// The event appended by [`Repository::delete`](crate::Repository::delete).
    fn tombstone() -> Self::Event;
}

/// An aggregate instance: identity, versioning, and pending events around a
/// folded [`AggregateState`].
///
/// The entity tracks two versions. `version` is the in-memory fold position
/// and advances on every applied event, raised or replayed.
/// `expected_version` is the last version known to be persisted; it is the
/// optimistic-concurrency precondition for the next save and only the
/// repository advances it.
pub struct EventSourcedEntity<A: AggregateState> {
    id: Uuid,
    version: Option<u64>,
    expected_version: Option<u64>,
    state: A,
    recorder: EventRecorder<A::Event>,
    source: Option<CorrelationContext>,
}

// Manual `Debug`: `A` is not required to be `Debug`, and the pending-event
// count is more useful than the buffer contents anyway.
impl<A: AggregateState> std::fmt::Debug for EventSourcedEntity<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcedEntity")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("expected_version", &self.expected_version)
            .field("pending_events", &self.recorder.len())
            .finish()
    }
}

impl<A: AggregateState> EventSourcedEntity<A> {
    /// Create a fresh entity: empty state, no version, nothing recorded.
    pub fn fresh(id: Uuid) -> Self {
        Self {
            id,
            version: None,
            expected_version: None,
            state: A::default(),
            recorder: EventRecorder::new(),
            source: None,
        }
    }

    /// The aggregate instance id (also its stream id).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Version of the last applied event, zero-based.
    ///
    /// `None` means fresh: no event has ever been applied. Three applied
    /// events put the entity at version 2.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Whether no event has ever been applied.
    pub fn is_fresh(&self) -> bool {
        self.version.is_none()
    }

    /// The folded domain state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Number of raised-but-unpersisted events.
    pub fn pending_events(&self) -> usize {
        self.recorder.len()
    }

    /// Thread in the context of the message this entity is handling.
    ///
    /// Every subsequently raised event is stamped `caused_by` this context:
    /// same correlation id, causation id equal to its message id.
    pub fn set_source(&mut self, source: CorrelationContext) {
        self.source = Some(source);
    }

    /// Raise a new domain event: stamp, apply, record.
    ///
    /// The event is applied to the state immediately -- the entity observes
    /// its own decisions before they are persisted -- and recorded for the
    /// next save. With no source context set, the event starts its own
    /// chain.
    pub fn raise(&mut self, event: A::Event) {
        let context = match &self.source {
            Some(source) => CorrelationContext::caused_by(source),
            None => CorrelationContext::origin(),
        };
        self.state.apply(&event);
        self.version = Some(self.version.map_or(0, |v| v + 1));
        self.recorder.record(PendingEvent {
            payload: event,
            context,
        });
    }

    /// Fold a persisted history into the entity.
    ///
    /// Normally called once on a fresh entity with the full (or
    /// version-bounded) history of its stream.
    ///
    /// # Errors
    ///
    /// * [`EntityError::InvalidState`] if recorded events are pending --
    ///   replaying history over unpersisted local decisions would reorder
    ///   them.
    /// * [`EntityError::InvalidArgument`] if `history` is empty.
    /// * [`EntityError::UnknownEventType`] / [`EntityError::DecodePayload`]
    ///   if an event does not decode. The entity is unchanged on error.
    pub fn restore_from_events(&mut self, history: &[StoredEvent]) -> Result<(), EntityError> {
        if !self.recorder.is_empty() {
            return Err(EntityError::InvalidState(
                "cannot restore while recorded events are pending",
            ));
        }
        if history.is_empty() {
            return Err(EntityError::InvalidArgument(
                "event history must not be empty",
            ));
        }
        self.fold(history)
    }

    /// Fold events recorded after this entity's current version.
    ///
    /// The caller states the version it believes the entity is at;
    /// `events` must be the stream's events strictly after it. An empty
    /// batch is a no-op (the entity was already current).
    ///
    /// # Errors
    ///
    /// * [`EntityError::InvalidState`] if the entity is fresh or recorded
    ///   events are pending.
    /// * [`EntityError::VersionConflict`] if `expected_version` does not
    ///   match the entity.
    /// * Decode failures as in [`restore_from_events`](Self::restore_from_events).
    pub fn update_with_events(
        &mut self,
        events: &[StoredEvent],
        expected_version: u64,
    ) -> Result<(), EntityError> {
        let Some(current) = self.version else {
            return Err(EntityError::InvalidState(
                "cannot update a fresh entity; restore it first",
            ));
        };
        if !self.recorder.is_empty() {
            return Err(EntityError::InvalidState(
                "cannot update while recorded events are pending",
            ));
        }
        if expected_version != current {
            return Err(EntityError::VersionConflict {
                expected: expected_version,
                actual: current,
            });
        }
        self.fold(events)
    }

    /// Drain the pending events for persistence.
    ///
    /// Query-and-mutate by design; confined to the repository so command
    /// handlers never observe the drain.
    pub(crate) fn take_events(&mut self) -> Vec<PendingEvent<A::Event>> {
        self.recorder.take_and_reset()
    }

    /// Last version known to be persisted; the next save's precondition.
    pub(crate) fn expected_version(&self) -> Option<u64> {
        self.expected_version
    }

    /// The source context threaded in via [`set_source`](Self::set_source),
    /// if any.
    pub(crate) fn source(&self) -> Option<CorrelationContext> {
        self.source
    }

    /// Advance the persisted-version cursor after a successful append of
    /// `appended` events (must be non-zero).
    pub(crate) fn advance_expected_version(&mut self, appended: u64) {
        self.expected_version = Some(match self.expected_version {
            Some(version) => version + appended,
            None => appended.saturating_sub(1),
        });
    }

    /// Decode everything first, then apply: a fold either lands whole or
    /// leaves the entity untouched.
    fn fold(&mut self, events: &[StoredEvent]) -> Result<(), EntityError> {
        let decoded = events
            .iter()
            .map(decode_event::<A::Event>)
            .collect::<Result<Vec<_>, _>>()?;
        for event in &decoded {
            self.state.apply(event);
            self.version = Some(self.version.map_or(0, |v| v + 1));
            self.expected_version = Some(self.expected_version.map_or(0, |v| v + 1));
        }
        Ok(())
    }
}
