//! Correlation-aware event sourcing: aggregates, repositories, and
//! checkpointed projections over an abstract event store.

mod checkpoint;
mod command;
mod correlation;
mod entity;
mod error;
mod event;
mod process;
mod projector;
mod recorder;
mod repository;
mod store;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use command::{Command, CommandDispatcher};
pub use correlation::CorrelationContext;
pub use entity::{AggregateState, EventSourcedEntity, SoftDeletable};
pub use error::{
    BoxedError, CheckpointError, EntityError, ProjectorError, RepositoryError, StoreError,
};
pub use event::{DomainEvent, ProposedEvent, StoredEvent, decode_event, encode_event, stream_uuid};
pub use process::{CommandDraft, ProcessManager, Reaction, register_process_manager};
pub use projector::{DeadLetterEntry, EventContext, EventProjector, FailurePolicy, ProjectorConfig};
pub use recorder::{EventRecorder, PendingEvent};
pub use repository::{CorrelatedRepository, Repository};
pub use store::{EventStore, EventStream, ExpectedVersion, InMemoryEventStore, SubscriptionItem};
