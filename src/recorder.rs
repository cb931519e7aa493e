//! In-memory buffer for events raised but not yet persisted.
//!
//! Each entity owns one [`EventRecorder`]. Recording and draining are
//! `pub(crate)`: application code can inspect the buffer but only the
//! entity/repository pair may mutate it, which keeps the drain-before-append
//! handshake out of reach of command handlers.

use crate::correlation::CorrelationContext;

/// An event raised on an entity, queued for its next save.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<E> {
    /// The typed domain event.
    pub payload: E,
    /// Identity chain stamped when the event was raised.
    pub context: CorrelationContext,
}

/// Append-only buffer of pending events for one entity instance.
///
/// Events are held in recording order. Nothing is validated or deduplicated
/// here; the recorder is bookkeeping, not policy.
#[derive(Debug)]
pub struct EventRecorder<E> {
    pending: Vec<PendingEvent<E>>,
}

impl<E> EventRecorder<E> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Append one event to the buffer.
    pub(crate) fn record(&mut self, event: PendingEvent<E>) {
        self.pending.push(event);
    }

    /// Return the buffered events in recording order and clear the buffer.
    ///
    /// Snapshot and reset happen as one step; there is no window in which
    /// the returned events are still observable through the recorder.
    pub(crate) fn take_and_reset(&mut self) -> Vec<PendingEvent<E>> {
        std::mem::take(&mut self.pending)
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<E> Default for EventRecorder<E> {
    fn default() -> Self {
        Self::new()
    }
}
