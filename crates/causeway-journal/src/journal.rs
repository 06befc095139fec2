//! Event journal recording every dispatched event with its attribution.
//!
//! The [`EventJournal`] records each event posted through an
//! [`EventDispatcher`](crate::dispatch::EventDispatcher) together with the
//! [`Cause`] snapshot that was current at dispatch time. Each entry
//! ([`RecordedEvent`]) also remembers how deeply the post was nested inside
//! other listeners and how many listeners ran or failed.
//!
//! Entries are recorded in post order: a re-entrant post made from inside a
//! listener gets a later sequence number than the event that triggered it,
//! even though it finishes first.
//!
//! # Query API
//!
//! - **Event type**: [`EventJournal::events_of_type`]
//! - **Cause type anywhere in the chain**: [`EventJournal::events_caused_by`]
//! - **Innermost cause type**: [`EventJournal::events_with_root`]
//! - **Context key present**: [`EventJournal::events_with_context`]
//!
//! # Example
//!
//! ```
//! use causeway_journal::journal::{Event, EventJournal};
//! use causeway_stack::prelude::*;
//!
//! #[derive(Debug)]
//! struct Player(&'static str);
//!
//! let mut causes = CauseStackManager::new();
//! causes.push_cause(CauseEntry::new(Player("alex"))).unwrap();
//!
//! let mut journal = EventJournal::new();
//! let cause = causes.get_current_cause().unwrap();
//! journal.record(Event::new("block_break", serde_json::json!({"x": 3})), cause, 0);
//!
//! assert_eq!(journal.len(), 1);
//! assert_eq!(journal.events_caused_by::<Player>().count(), 1);
//! ```

use std::any::Any;

use causeway_stack::cause::Cause;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An event posted to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Listeners subscribe by this name (e.g. `"block_break"`).
    pub event_type: String,
    /// Arbitrary event data.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// An event with no payload.
    pub fn named(event_type: impl Into<String>) -> Self {
        Self::new(event_type, serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// RecordedEvent
// ---------------------------------------------------------------------------

/// A dispatched event with its attribution.
///
/// `listeners_run` and `listener_failures` are filled in once dispatch of
/// the event finishes; until then both are zero.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Position in post order, starting at 0 and never reused.
    pub sequence: u64,
    pub event: Event,
    /// The cause that was current when the event was posted.
    pub cause: Cause,
    /// Number of dispatches already in progress when this one started.
    pub depth: usize,
    pub listeners_run: usize,
    pub listener_failures: usize,
}

impl RecordedEvent {
    /// Render the record as JSON, with the cause described entry by entry.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sequence": self.sequence,
            "event_type": self.event.event_type,
            "payload": self.event.payload,
            "cause": self.cause.describe(),
            "context": self.cause.context().to_json(),
            "depth": self.depth,
            "listeners_run": self.listeners_run,
            "listener_failures": self.listener_failures,
        })
    }
}

// ---------------------------------------------------------------------------
// EventJournal
// ---------------------------------------------------------------------------

/// Accumulates [`RecordedEvent`] entries and provides query methods.
#[derive(Debug, Clone, Default)]
pub struct EventJournal {
    events: Vec<RecordedEvent>,
    next_sequence: u64,
}

impl EventJournal {
    /// Create a new, empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a posted event and return its sequence number.
    pub fn record(&mut self, event: Event, cause: Cause, depth: usize) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.events.push(RecordedEvent {
            sequence,
            event,
            cause,
            depth,
            listeners_run: 0,
            listener_failures: 0,
        });
        sequence
    }

    /// Fill in listener counts once dispatch of `sequence` finished.
    ///
    /// Returns `false` if the entry is no longer in the journal (it was
    /// cleared while the event was being dispatched).
    pub fn finish(&mut self, sequence: u64, listeners_run: usize, listener_failures: usize) -> bool {
        let Ok(index) = self.events.binary_search_by_key(&sequence, |e| e.sequence) else {
            return false;
        };
        let entry = &mut self.events[index];
        entry.listeners_run = listeners_run;
        entry.listener_failures = listener_failures;
        true
    }

    /// Drop all recorded events. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All recorded events in post order.
    pub fn all_events(&self) -> &[RecordedEvent] {
        &self.events
    }

    /// Look up a record by sequence number.
    pub fn get(&self, sequence: u64) -> Option<&RecordedEvent> {
        self.events
            .binary_search_by_key(&sequence, |e| e.sequence)
            .ok()
            .map(|index| &self.events[index])
    }

    /// Events of the given type.
    pub fn events_of_type<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a RecordedEvent> {
        self.events
            .iter()
            .filter(move |e| e.event.event_type == event_type)
    }

    /// Events with a `T` anywhere in their cause.
    pub fn events_caused_by<T: Any>(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.events
            .iter()
            .filter(|e| e.cause.first::<T>().is_some())
    }

    /// Events whose innermost cause is a `T`.
    pub fn events_with_root<T: Any>(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.events
            .iter()
            .filter(|e| e.cause.root().is_some_and(|root| root.is::<T>()))
    }

    /// Events whose context carried a value for `key_id`.
    pub fn events_with_context<'a>(&'a self, key_id: &'a str) -> impl Iterator<Item = &'a RecordedEvent> {
        self.events
            .iter()
            .filter(move |e| e.cause.context().contains_key(key_id))
    }

    /// Render the whole journal as a JSON array.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.events.iter().map(RecordedEvent::to_json).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
