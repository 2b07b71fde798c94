// Notification Source
//
// Contract for fetching ordered metastore notifications, plus an
// in-memory change log used for replay and tests.

use std::collections::VecDeque;

use crate::event::{EventId, RawEvent};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("event id conflict: expected the id after {last}, got {actual}")]
    IdConflict { last: EventId, actual: EventId },

    #[error("notification source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies notifications in ascending id order.
///
/// Implementations MUST:
/// - return only events with `id > after`
/// - return ids strictly ascending with no gaps within one call
///
/// An empty result means there is nothing new.
pub trait NotificationSource: Send + Sync {
    fn fetch_after(
        &self,
        after: Option<EventId>,
        max_events: usize,
    ) -> Result<Vec<RawEvent>, SourceError>;
}

/// Append-only, gap-free notification log held in memory.
#[derive(Debug, Default)]
pub struct NotificationLog {
    events: VecDeque<RawEvent>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Append a notification. After the first one, ids must be contiguous.
    pub fn append(&mut self, event: RawEvent) -> Result<(), SourceError> {
        if let Some(last) = self.events.back() {
            if last.id.checked_add(1) != Some(event.id) {
                return Err(SourceError::IdConflict {
                    last: last.id,
                    actual: event.id,
                });
            }
        }

        self.events.push_back(event);
        Ok(())
    }

    pub fn current_id(&self) -> Option<EventId> {
        self.events.back().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl NotificationSource for NotificationLog {
    fn fetch_after(
        &self,
        after: Option<EventId>,
        max_events: usize,
    ) -> Result<Vec<RawEvent>, SourceError> {
        Ok(self
            .events
            .iter()
            .filter(|e| after.map_or(true, |last| e.id > last))
            .take(max_events)
            .cloned()
            .collect())
    }
}
