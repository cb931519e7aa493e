//! Aggregate repositories: load, refresh, save, and delete entities against
//! any [`EventStore`].
//!
//! The repository owns no locks and never retries. Correctness under
//! concurrency rests entirely on the store's atomic compare-and-append: a
//! save that loses the race surfaces [`RepositoryError::VersionConflict`]
//! and the caller refreshes and re-executes its command.
//! [`CorrelatedRepository`] is the same surface with a source context
//! threaded into every entity it hands out, so raised events continue the
//! caller's message chain.

use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::entity::{AggregateState, EventSourcedEntity, SoftDeletable};
use crate::error::{EntityError, RepositoryError, StoreError};
use crate::event::{ProposedEvent, encode_event};
use crate::store::{EventStore, ExpectedVersion};

/// Load/save gateway for event-sourced entities.
///
/// `Clone` is as cheap as cloning the store handle.
#[derive(Debug, Clone)]
pub struct Repository<S> {
    store: S,
}

impl<S: EventStore> Repository<S> {
    /// Create a repository over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load an aggregate from its full history.
    ///
    /// # Errors
    ///
    /// * [`RepositoryError::NotFound`] if the stream is empty or absent.
    /// * [`RepositoryError::Deleted`] if the folded state is logically
    ///   deleted.
    /// * Decode failures from the fold.
    pub async fn get_by_id<A: AggregateState>(
        &self,
        id: Uuid,
    ) -> Result<EventSourcedEntity<A>, RepositoryError> {
        self.get_by_id_as_of(id, u64::MAX).await
    }

    /// Load an aggregate as of `version` (inclusive).
    ///
    /// A bounded load that stops before a later tombstone succeeds: the
    /// aggregate existed at that version, so its historical state is
    /// readable even after logical deletion.
    pub async fn get_by_id_as_of<A: AggregateState>(
        &self,
        id: Uuid,
        version: u64,
    ) -> Result<EventSourcedEntity<A>, RepositoryError> {
        let history = self
            .store
            .read_stream(id, 0, version)
            .await
            .map_err(|e| map_store_error(id, e))?;
        if history.is_empty() {
            return Err(RepositoryError::NotFound(id));
        }
        let mut entity = EventSourcedEntity::<A>::fresh(id);
        entity.restore_from_events(&history)?;
        if entity.state().is_deleted() {
            return Err(RepositoryError::Deleted(id));
        }
        Ok(entity)
    }

    /// Load an aggregate, mapping absence to `Ok(None)` instead of an
    /// error.
    ///
    /// Only absence is absorbed; a deleted aggregate or a failed fold still
    /// surfaces as an error.
    pub async fn try_get_by_id<A: AggregateState>(
        &self,
        id: Uuid,
    ) -> Result<Option<EventSourcedEntity<A>>, RepositoryError> {
        match self.get_by_id(id).await {
            Ok(entity) => Ok(Some(entity)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Refresh a held entity with the events persisted since it was loaded.
    pub async fn update<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        self.update_to(entity, u64::MAX).await
    }

    /// Refresh a held entity with persisted events up to `version`
    /// (inclusive).
    ///
    /// When the entity is in sync with its persisted cursor this folds only
    /// the events strictly after its current version. After a failed save
    /// the in-memory fold contains locally applied events the store never
    /// accepted; an incremental fold on top of those would be wrong, so the
    /// entity is rebuilt from the full history instead (the source context
    /// is preserved). Either way the entity ends at the store's truth.
    ///
    /// # Errors
    ///
    /// As for [`get_by_id_as_of`](Self::get_by_id_as_of), plus
    /// [`EntityError::InvalidState`] if the entity is fresh or has pending
    /// recorded events.
    pub async fn update_to<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
        version: u64,
    ) -> Result<(), RepositoryError> {
        let Some(current) = entity.version() else {
            return Err(RepositoryError::Entity(EntityError::InvalidState(
                "cannot refresh a fresh entity; load it first",
            )));
        };
        if entity.pending_events() > 0 {
            return Err(RepositoryError::Entity(EntityError::InvalidState(
                "cannot refresh while recorded events are pending",
            )));
        }

        let id = entity.id();
        let history = self
            .store
            .read_stream(id, 0, version)
            .await
            .map_err(|e| map_store_error(id, e))?;
        if history.is_empty() {
            return Err(RepositoryError::NotFound(id));
        }

        if entity.version() == entity.expected_version() {
            let new_events: Vec<_> = history.into_iter().filter(|e| e.version > current).collect();
            entity.update_with_events(&new_events, current)?;
        } else {
            let mut rebuilt = EventSourcedEntity::fresh(id);
            if let Some(source) = entity.source() {
                rebuilt.set_source(source);
            }
            rebuilt.restore_from_events(&history)?;
            *entity = rebuilt;
        }

        if entity.state().is_deleted() {
            return Err(RepositoryError::Deleted(id));
        }
        Ok(())
    }

    /// Persist the entity's pending events with an optimistic-concurrency
    /// precondition.
    ///
    /// Draining an empty buffer is a no-op, so calling save twice appends
    /// nothing twice. On success the entity's persisted cursor advances by
    /// the number of events appended.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::VersionConflict`] if a concurrent writer appended
    /// first. The drained events are not re-queued: the command that
    /// produced them was decided against stale state, so the caller must
    /// refresh (or reload) and re-execute it.
    pub async fn save<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        let pending = entity.take_events();
        if pending.is_empty() {
            return Ok(());
        }

        let expected = match entity.expected_version() {
            None => ExpectedVersion::NoStream,
            Some(version) => ExpectedVersion::Exact(version),
        };
        let mut proposed = Vec::with_capacity(pending.len());
        for event in &pending {
            let (event_type, payload) =
                encode_event(&event.payload).map_err(RepositoryError::Codec)?;
            proposed.push(ProposedEvent {
                event_type,
                payload,
                context: event.context,
            });
        }

        let appended = proposed.len() as u64;
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %entity.id(),
            events = appended,
            expected = %expected,
            "saving aggregate"
        );
        self.store
            .append_to_stream(entity.id(), expected, proposed)
            .await
            .map_err(|e| map_store_error(entity.id(), e))?;
        entity.advance_expected_version(appended);
        Ok(())
    }

    /// Logically delete an aggregate by appending its tombstone event.
    ///
    /// Goes through the identical versioned-append path as
    /// [`save`](Self::save); any events already pending ride along in the
    /// same append, ahead of the tombstone. Afterwards
    /// [`get_by_id`](Self::get_by_id) reports the aggregate deleted while
    /// bounded loads before the tombstone still succeed.
    pub async fn delete<A: SoftDeletable>(
        &self,
        entity: &mut EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        entity.raise(A::tombstone());
        self.save(entity).await
    }

    /// Physically remove the aggregate's stream.
    ///
    /// Consumes the entity: after a hard delete there is nothing left to
    /// hold. The removal carries the same version precondition as a save,
    /// so a concurrent writer turns this into a
    /// [`RepositoryError::VersionConflict`].
    pub async fn hard_delete<A: AggregateState>(
        &self,
        entity: EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        let Some(version) = entity.expected_version() else {
            return Err(RepositoryError::Entity(EntityError::InvalidState(
                "cannot hard-delete an aggregate that was never persisted",
            )));
        };
        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %entity.id(),
            "hard-deleting stream"
        );
        self.store
            .delete_stream(entity.id(), ExpectedVersion::Exact(version))
            .await
            .map_err(|e| map_store_error(entity.id(), e))
    }
}

/// [`Repository`] with a source context threaded through every load.
///
/// Entities handed out by this wrapper have
/// [`set_source`](EventSourcedEntity::set_source) already called, so every
/// event they raise -- tombstones included -- carries the caller's
/// correlation id and is caused by the caller's message.
#[derive(Debug, Clone)]
pub struct CorrelatedRepository<S> {
    inner: Repository<S>,
}

impl<S: EventStore> CorrelatedRepository<S> {
    /// Create a correlated repository over `store`.
    pub fn new(store: S) -> Self {
        Self {
            inner: Repository::new(store),
        }
    }

    /// The underlying plain repository.
    pub fn uncorrelated(&self) -> &Repository<S> {
        &self.inner
    }

    /// Construct a fresh entity with the source context already threaded.
    pub fn fresh<A: AggregateState>(
        &self,
        id: Uuid,
        source: &CorrelationContext,
    ) -> EventSourcedEntity<A> {
        let mut entity = EventSourcedEntity::fresh(id);
        entity.set_source(*source);
        entity
    }

    /// [`Repository::get_by_id`] plus source threading.
    pub async fn get_by_id<A: AggregateState>(
        &self,
        id: Uuid,
        source: &CorrelationContext,
    ) -> Result<EventSourcedEntity<A>, RepositoryError> {
        let mut entity = self.inner.get_by_id(id).await?;
        entity.set_source(*source);
        Ok(entity)
    }

    /// [`Repository::get_by_id_as_of`] plus source threading.
    pub async fn get_by_id_as_of<A: AggregateState>(
        &self,
        id: Uuid,
        version: u64,
        source: &CorrelationContext,
    ) -> Result<EventSourcedEntity<A>, RepositoryError> {
        let mut entity = self.inner.get_by_id_as_of(id, version).await?;
        entity.set_source(*source);
        Ok(entity)
    }

    /// [`Repository::try_get_by_id`] plus source threading.
    pub async fn try_get_by_id<A: AggregateState>(
        &self,
        id: Uuid,
        source: &CorrelationContext,
    ) -> Result<Option<EventSourcedEntity<A>>, RepositoryError> {
        let mut entity = self.inner.try_get_by_id(id).await?;
        if let Some(entity) = &mut entity {
            entity.set_source(*source);
        }
        Ok(entity)
    }

    /// [`Repository::update`] plus source threading.
    pub async fn update<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
        source: &CorrelationContext,
    ) -> Result<(), RepositoryError> {
        self.inner.update(entity).await?;
        entity.set_source(*source);
        Ok(())
    }

    /// [`Repository::update_to`] plus source threading.
    pub async fn update_to<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
        version: u64,
        source: &CorrelationContext,
    ) -> Result<(), RepositoryError> {
        self.inner.update_to(entity, version).await?;
        entity.set_source(*source);
        Ok(())
    }

    /// Same as [`Repository::save`]; events were stamped when raised.
    pub async fn save<A: AggregateState>(
        &self,
        entity: &mut EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        self.inner.save(entity).await
    }

    /// [`Repository::delete`] with the tombstone stamped into the caller's
    /// chain.
    pub async fn delete<A: SoftDeletable>(
        &self,
        entity: &mut EventSourcedEntity<A>,
        source: &CorrelationContext,
    ) -> Result<(), RepositoryError> {
        entity.set_source(*source);
        self.inner.delete(entity).await
    }

    /// Same as [`Repository::hard_delete`].
    pub async fn hard_delete<A: AggregateState>(
        &self,
        entity: EventSourcedEntity<A>,
    ) -> Result<(), RepositoryError> {
        self.inner.hard_delete(entity).await
    }
}

fn map_store_error(aggregate_id: Uuid, err: StoreError) -> RepositoryError {
    match err {
        StoreError::VersionConflict {
            expected, actual, ..
        } => RepositoryError::VersionConflict {
            aggregate_id,
            expected,
            actual,
        },
        StoreError::StreamNotFound(_) => RepositoryError::NotFound(aggregate_id),
        other => RepositoryError::Store(other),
    }
}
