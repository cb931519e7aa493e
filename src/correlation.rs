//! Message identity and the correlation/causation chain.
//!
//! Every message in the system -- commands in, events out -- carries a
//! [`CorrelationContext`]: its own id, the id of the chain it belongs to, and
//! the id of the message that directly caused it. Contexts are tiny `Copy`
//! values passed explicitly at every boundary; nothing is ambient.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity triple stamped on every command and event.
///
/// The three ids relate as follows:
///
/// * `message_id` -- unique to this message.
/// * `correlation_id` -- shared by every message in one business
///   transaction; equal to the origin message's id.
/// * `causation_id` -- the `message_id` of the direct parent. An origin
///   message is its own cause, so a causation walk always terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationContext {
    message_id: Uuid,
    correlation_id: Uuid,
    causation_id: Uuid,
}

impl CorrelationContext {
    /// Builds the context for a message that starts a new chain.
    ///
    /// All three ids are the same freshly generated UUID, so
    /// [`is_origin`](Self::is_origin) holds.
    pub fn origin() -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            correlation_id: message_id,
            causation_id: message_id,
        }
    }

    /// Builds the context for a message caused by `parent`.
    ///
    /// The child gets a fresh `message_id`, inherits the parent's
    /// `correlation_id`, and records the parent's `message_id` as its
    /// `causation_id`.
    pub fn caused_by(parent: &CorrelationContext) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: parent.correlation_id,
            causation_id: parent.message_id,
        }
    }

    /// The unique id of this message.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// The id shared by every message in this chain.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// The id of the message that directly caused this one.
    pub fn causation_id(&self) -> Uuid {
        self.causation_id
    }

    /// Whether this message started its chain (it is its own cause).
    pub fn is_origin(&self) -> bool {
        self.causation_id == self.message_id
    }
}
