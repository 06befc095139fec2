//! Causeway Journal - event dispatch and cause-attributed event records.
//!
//! This crate sits on top of [`causeway_stack`]. It routes events to
//! listeners, running each listener inside its own cause frame so that
//! whatever it posts in turn is attributed to it, and keeps a journal of
//! every dispatched event with the cause that was current when it was posted.
//!
//! # Modules
//!
//! - [`dispatch`]: [`EventDispatcher`](dispatch::EventDispatcher) with
//!   re-entrant posting and a nesting cap.
//! - [`journal`]: [`EventJournal`](journal::EventJournal) recording each
//!   event with its cause, queryable by event type, cause type and context
//!   key.

#![deny(unsafe_code)]

pub mod dispatch;
pub mod journal;

use causeway_stack::CauseError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while dispatching events.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The cause stack rejected an operation (thread affinity or frame
    /// corruption).
    #[error(transparent)]
    Cause(#[from] CauseError),

    /// A listener posted events nested deeper than the dispatcher allows.
    #[error("event '{event_type}' dropped: dispatch nested more than {limit} levels deep")]
    ReentrancyLimit {
        limit: usize,
        event_type: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::dispatch::{
        DispatchReport, EventDispatcher, ListenerCause, ListenerError, ListenerId, LISTENER,
    };
    pub use crate::journal::{Event, EventJournal, RecordedEvent};
    pub use crate::JournalError;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
