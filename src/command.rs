//! Typed commands and the dispatch seam.
//!
//! A [`Command`] pairs a payload with the aggregate it targets and the
//! identity chain it belongs to. Constructing one forces the chain choice:
//! [`origin`](Command::origin) opens a fresh chain for commands arriving
//! from the outside, [`caused_by`](Command::caused_by) continues the chain
//! of the message -- usually an event -- that provoked it.
//!
//! [`CommandDispatcher`] is the seam between reactive components and
//! command execution: process managers hand their follow-up commands to a
//! dispatcher instead of reaching into repositories themselves.

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationContext;
use crate::error::BoxedError;

/// A command addressed to one aggregate instance.
///
/// The context travels with the command: events raised while handling it
/// inherit its correlation id and point back at its message id, so the
/// whole story of a request can be reassembled from the log.
///
/// # Examples
///
/// ```
/// use causeway_es::Command;
/// use uuid::Uuid;
///
/// let open = Command::origin(Uuid::new_v4(), "open-account");
/// assert!(open.context.is_origin());
///
/// let fund = Command::caused_by(Uuid::new_v4(), "fund-account", &open.context);
/// assert_eq!(fund.context.correlation_id(), open.context.correlation_id());
/// assert_eq!(fund.context.causation_id(), open.context.message_id());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command<C> {
    /// The aggregate instance this command targets.
    pub aggregate_id: Uuid,
    /// The command payload.
    pub payload: C,
    /// Identity chain the command belongs to.
    pub context: CorrelationContext,
}

impl<C> Command<C> {
    /// A command entering the system from outside: it starts its own
    /// correlation chain.
    pub fn origin(aggregate_id: Uuid, payload: C) -> Self {
        Self {
            aggregate_id,
            payload,
            context: CorrelationContext::origin(),
        }
    }

    /// A command provoked by an earlier message, typically an event a
    /// reactive component observed.
    ///
    /// The command keeps the parent's correlation id and records the
    /// parent's message id as its cause.
    pub fn caused_by(aggregate_id: Uuid, payload: C, parent: &CorrelationContext) -> Self {
        Self {
            aggregate_id,
            payload,
            context: CorrelationContext::caused_by(parent),
        }
    }
}

/// Executes commands of one payload type against their target aggregates.
///
/// Implementations load the target through a repository, decide, raise,
/// and save. Failures are surfaced as boxed errors so callers -- process
/// manager loops in particular -- can apply their own failure policy
/// without knowing the concrete error type.
pub trait CommandDispatcher<C>: Send + Sync {
    /// Execute `command` to completion.
    fn dispatch(&self, command: Command<C>) -> impl Future<Output = Result<(), BoxedError>> + Send;
}
