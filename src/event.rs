//! The event wire model.
//!
//! Domain events are adjacently tagged serde enums. Each aggregate's event
//! type declares the full table of wire tags it understands
//! ([`DomainEvent::TYPES`]); decoding is a lookup in that static table, and a
//! tag missing from it is a loud [`EntityError::UnknownEventType`] rather
//! than a silent skip. Events travel as [`ProposedEvent`] on the way into a
//! store and come back as [`StoredEvent`] with their stream and log
//! coordinates filled in.

use serde::de::DeserializeOwned;
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::error::EntityError;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All computed stream ids are UUID v5 values derived from this namespace
/// and the `"{kind}/{key}"` string, so the same identity always maps to the
/// same stream regardless of which process performs the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2f, 0x1a, 0x8d, 0x4e, 0x5b, 0x6c, 0x4a, 0x3f, 0x9e, 0x7d, 0x0c, 0x1b, 0x2a, 0x3e, 0x4d, 0x5f,
]);

/// A domain event payload.
///
/// # Contract
///
/// Implementors must serialize as an adjacently tagged JSON object
/// (`#[serde(tag = "type", content = "data")]` on an enum), and
/// [`TYPES`](Self::TYPES) must list the wire tag of every variant. The table
/// is what makes event dispatch static: folds and projections route by tag
/// lookup, and a stored tag absent from the table fails with
/// [`EntityError::UnknownEventType`] instead of being skipped.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every wire tag this revision of the event type understands.
    const TYPES: &'static [&'static str];
}

/// An event drained from an entity, ready to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Event type tag extracted from the serialized payload.
    pub event_type: String,
    /// The full adjacently tagged JSON object.
    pub payload: Value,
    /// Identity chain stamped when the event was raised.
    pub context: CorrelationContext,
}

/// An event as recorded in an event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// The stream (aggregate instance) this event belongs to.
    pub stream_id: Uuid,
    /// Zero-based version within the stream.
    pub version: u64,
    /// Zero-based position in the global log.
    pub position: u64,
    /// Event type tag of the payload.
    pub event_type: String,
    /// The full adjacently tagged JSON object.
    pub payload: Value,
    /// Identity chain stamped when the event was raised.
    pub context: CorrelationContext,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

impl StoredEvent {
    /// The event's own message id, taken from its correlation context.
    pub fn event_id(&self) -> Uuid {
        self.context.message_id()
    }
}

/// Serialize a domain event and extract its wire tag.
///
/// # Returns
///
/// The tag and the full adjacently tagged JSON object, ready to become a
/// [`ProposedEvent`].
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails or if the event does
/// not serialize as a tagged object (see the [`DomainEvent`] contract).
pub fn encode_event<E: DomainEvent>(event: &E) -> Result<(String, Value), serde_json::Error> {
    let payload = serde_json::to_value(event)?;
    let Some(tag) = payload.get("type").and_then(Value::as_str) else {
        return Err(serde_json::Error::custom(
            "domain events must serialize as adjacently tagged objects with a string `type` field",
        ));
    };
    let tag = tag.to_owned();
    Ok((tag, payload))
}

/// Decode a stored event into a typed payload.
///
/// # Errors
///
/// * [`EntityError::UnknownEventType`] if the stored tag is not listed in
///   `E::TYPES`.
/// * [`EntityError::DecodePayload`] if the tag is registered but the payload
///   does not deserialize.
pub fn decode_event<E: DomainEvent>(event: &StoredEvent) -> Result<E, EntityError> {
    if !E::TYPES.contains(&event.event_type.as_str()) {
        return Err(EntityError::UnknownEventType {
            event_type: event.event_type.clone(),
        });
    }
    serde_json::from_value(event.payload.clone()).map_err(|source| EntityError::DecodePayload {
        event_type: event.event_type.clone(),
        source,
    })
}

/// Derive a deterministic stream UUID from a kind and a key.
///
/// Uses UUID v5 (SHA-1 based) with a fixed namespace to produce a stable,
/// collision-resistant stream identifier. Used for streams whose identity is
/// computed rather than generated, such as process-manager instances keyed
/// by correlation id.
///
/// # Examples
///
/// ```
/// use causeway_es::stream_uuid;
/// let id = stream_uuid("billing", "7f3c");
/// assert_eq!(id, stream_uuid("billing", "7f3c")); // deterministic
/// ```
pub fn stream_uuid(kind: &str, key: &str) -> Uuid {
    let name = format!("{kind}/{key}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}
