//! Crate-level error types.
//!
//! Each layer has its own small enum -- entity folds, the store contract,
//! the repository, checkpoints, and the projector -- nested transparently so
//! every failure kind stays distinguishable at the outer API: invalid
//! argument, invalid state, version conflict, aggregate not found, aggregate
//! deleted, unknown event type, and projection handler failure.

use uuid::Uuid;

use crate::store::ExpectedVersion;

/// Type-erased error for handler and dispatcher boundaries.
///
/// Projection handlers and command dispatchers are application code; the
/// core carries their failures opaquely and applies policy to them.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Error raised by an entity fold or its preconditions.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The entity is in the wrong lifecycle state for the operation.
    ///
    /// Restoring over unpersisted recorded events and refreshing a fresh
    /// entity both land here.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The caller's expected version does not match the entity's.
    #[error("version conflict: expected version {expected}, entity is at {actual}")]
    VersionConflict {
        /// Version the caller believed the entity was at.
        expected: u64,
        /// Version the entity is actually at.
        actual: u64,
    },

    /// A stored event's tag is not in the event type's registered table.
    ///
    /// Unknown events are never skipped; an old revision replaying a stream
    /// written by a newer one must fail loudly rather than fold a partial
    /// history.
    #[error("unknown event type '{event_type}'")]
    UnknownEventType {
        /// The unregistered wire tag.
        event_type: String,
    },

    /// The tag is registered but the stored payload does not deserialize.
    #[error("failed to decode '{event_type}' payload: {source}")]
    DecodePayload {
        /// Wire tag of the corrupt event.
        event_type: String,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by an [`EventStore`](crate::EventStore)
/// implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The append's expected-version precondition failed.
    ///
    /// Exactly one of two concurrent appends with the same expectation can
    /// succeed; the loser receives this.
    #[error("version conflict on stream {stream_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        /// Stream the append targeted.
        stream_id: Uuid,
        /// The precondition that failed.
        expected: ExpectedVersion,
        /// Current last version of the stream, `None` if it does not exist.
        actual: Option<u64>,
    },

    /// The stream does not exist (deletion only; reads map absence to
    /// an empty history instead).
    #[error("stream {0} does not exist")]
    StreamNotFound(Uuid),

    /// An empty batch was passed to append.
    #[error("cannot append an empty event batch")]
    EmptyAppend,

    /// A live subscriber fell behind the fan-out buffer and missed events.
    ///
    /// Recoverable: consumers resubscribe from their checkpoint.
    #[error("subscriber lagged behind the live feed, {missed} events were dropped")]
    SubscriptionLagged {
        /// How many events the subscriber missed.
        missed: u64,
    },

    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by [`Repository`](crate::Repository)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The aggregate's stream is empty or absent.
    #[error("aggregate {0} not found")]
    NotFound(Uuid),

    /// The aggregate's fold ends in the logically-deleted state.
    ///
    /// The stream still exists; a bounded read that stops before the
    /// tombstone succeeds.
    #[error("aggregate {0} has been deleted")]
    Deleted(Uuid),

    /// A save or hard delete lost an optimistic concurrency race.
    ///
    /// The drained events are gone; the caller reloads the aggregate and
    /// re-executes its command. The repository never retries on its own.
    #[error("version conflict on aggregate {aggregate_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        /// Aggregate whose append lost the race.
        aggregate_id: Uuid,
        /// The precondition that failed.
        expected: ExpectedVersion,
        /// Current last version of the stream, `None` if it does not exist.
        actual: Option<u64>,
    },

    /// An entity fold or precondition failed.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// A drained event could not be serialized for append.
    #[error("failed to encode domain event: {0}")]
    Codec(#[source] serde_json::Error),

    /// The store failed for a reason other than a version conflict.
    #[error(transparent)]
    Store(StoreError),
}

/// Error returned by a [`CheckpointStore`](crate::CheckpointStore).
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The consumer name is empty.
    #[error("consumer name must not be empty")]
    EmptyConsumerName,

    /// Underlying storage I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The checkpoint record could not be encoded.
    #[error("failed to encode checkpoint: {0}")]
    Codec(#[source] serde_json::Error),
}

/// Error returned by [`EventProjector`](crate::EventProjector)
/// operations and consumer loops.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// No handlers were ever subscribed under this consumer name.
    #[error("no handlers registered for consumer '{0}'")]
    UnknownConsumer(String),

    /// The consumer already has a running loop.
    #[error("consumer '{0}' is already running")]
    AlreadyRunning(String),

    /// The consumer has no running loop to stop.
    #[error("consumer '{0}' is not running")]
    NotRunning(String),

    /// Reading or persisting the consumer's checkpoint failed.
    ///
    /// Fatal for the loop: without a trustworthy resume position the
    /// consumer cannot guarantee ordered, gap-free delivery.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Appending to the dead-letter log failed.
    ///
    /// The loop stops instead of advancing: losing the event *and* its
    /// dead-letter record would be silent data loss.
    #[error("failed to record dead letter: {0}")]
    DeadLetter(#[source] std::io::Error),

    /// A handler failed and the failure policy stops the consumer.
    ///
    /// Under [`FailurePolicy::Block`](crate::FailurePolicy::Block)
    /// the checkpoint is not advanced, so a later start resumes at the
    /// failed event.
    #[error("handler for '{event_type}' failed at position {position} for consumer '{consumer}'")]
    Handler {
        /// Consumer whose handler failed.
        consumer: String,
        /// Wire tag of the event being dispatched.
        event_type: String,
        /// Global position of the event being dispatched.
        position: u64,
        /// The handler's own error.
        #[source]
        source: BoxedError,
    },

    /// The consumer task panicked.
    #[error("consumer task panicked")]
    TaskPanicked,
}
