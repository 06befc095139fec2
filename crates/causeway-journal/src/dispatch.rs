//! Event dispatch with per-listener cause frames.
//!
//! [`EventDispatcher::post`] snapshots the current [`Cause`] once, records the
//! event in the dispatcher's [`EventJournal`], then runs every listener
//! subscribed to the event type. Each listener runs inside its own cause
//! frame with its [`ListenerCause`] pushed and the [`LISTENER`] context key
//! set, so anything the listener posts in turn is attributed to it. Whatever
//! the listener pushes or adds to the context is rolled back when its frame
//! closes.
//!
//! Listeners may post further events re-entrantly. Nesting is capped at
//! [`EventDispatcher::max_depth`] levels.
//!
//! # Example
//!
//! ```
//! use causeway_journal::prelude::*;
//! use causeway_stack::prelude::*;
//!
//! let mut causes = CauseStackManager::new();
//! let mut dispatcher = EventDispatcher::new();
//!
//! dispatcher.subscribe("explosion", "break_blocks", |causes, dispatcher, _event, _cause| {
//!     dispatcher.post(causes, Event::named("block_break"))?;
//!     Ok(())
//! });
//!
//! dispatcher.post(&mut causes, Event::named("explosion")).unwrap();
//!
//! let nested = dispatcher.journal().events_of_type("block_break").next().unwrap();
//! assert_eq!(
//!     nested.cause.first::<ListenerCause>().map(|l| l.name.as_str()),
//!     Some("break_blocks")
//! );
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use causeway_stack::cause::{Cause, CauseEntry};
use causeway_stack::context::ContextKey;
use causeway_stack::manager::CauseStackManager;

use crate::journal::{Event, EventJournal};
use crate::JournalError;

/// Context key naming the listener currently running.
pub const LISTENER: ContextKey<String> = ContextKey::new("causeway.listener");

/// Default cap on re-entrant dispatch nesting.
pub const DEFAULT_MAX_DEPTH: usize = 64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Listener types
// ---------------------------------------------------------------------------

/// Identifies a subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The cause pushed while a listener runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerCause {
    pub id: ListenerId,
    pub name: String,
}

/// Error a listener may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Listener callback.
///
/// Receives the manager (inside the listener's frame), the dispatcher for
/// re-entrant posts, the event and the cause snapshot taken when the event
/// was posted. An `Err` is logged and counted; it does not stop dispatch.
pub type ListenerFn =
    dyn Fn(&mut CauseStackManager, &mut EventDispatcher, &Event, &Cause) -> Result<(), ListenerError>
        + Send
        + Sync;

struct Listener {
    id: ListenerId,
    event_type: String,
    name: String,
    entry: CauseEntry,
    handler: Box<ListenerFn>,
}

/// Outcome of a single [`EventDispatcher::post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sequence number of the journal entry.
    pub sequence: u64,
    pub listeners_run: usize,
    pub listener_failures: usize,
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Routes events to listeners and journals them with their cause.
pub struct EventDispatcher {
    listeners: Vec<Arc<Listener>>,
    journal: EventJournal,
    depth: usize,
    max_depth: usize,
}

impl EventDispatcher {
    /// Create a dispatcher with no listeners and [`DEFAULT_MAX_DEPTH`].
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Create a dispatcher that refuses posts nested deeper than `max_depth`.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            listeners: Vec::new(),
            journal: EventJournal::new(),
            depth: 0,
            max_depth,
        }
    }

    /// Subscribe `handler` to events of `event_type`.
    ///
    /// Listeners run in subscription order.
    pub fn subscribe<F>(&mut self, event_type: impl Into<String>, name: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&mut CauseStackManager, &mut EventDispatcher, &Event, &Cause) -> Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        self.listeners.push(Arc::new(Listener {
            id,
            event_type: event_type.into(),
            entry: CauseEntry::new(ListenerCause {
                id,
                name: name.clone(),
            }),
            name,
            handler: Box::new(handler),
        }));
        id
    }

    /// Remove a subscription. A post already in progress still runs it.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    /// Post an event.
    ///
    /// The event is journaled before any listener runs. Cause stack errors
    /// (thread affinity, frame corruption) abort dispatch and propagate;
    /// listener errors do not.
    pub fn post(&mut self, causes: &mut CauseStackManager, event: Event) -> Result<DispatchReport, JournalError> {
        if self.depth >= self.max_depth {
            tracing::warn!(
                event_type = %event.event_type,
                limit = self.max_depth,
                "event dispatch nested too deeply, dropping event"
            );
            return Err(JournalError::ReentrancyLimit {
                limit: self.max_depth,
                event_type: event.event_type,
            });
        }

        let cause = causes.get_current_cause()?;
        let sequence = self.journal.record(event.clone(), cause.clone(), self.depth);
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .iter()
            .filter(|l| l.event_type == event.event_type)
            .cloned()
            .collect();

        self.depth += 1;
        let outcome = self.run_listeners(causes, &listeners, &event, &cause);
        self.depth -= 1;
        let (listeners_run, listener_failures) = outcome?;

        self.journal.finish(sequence, listeners_run, listener_failures);
        tracing::trace!(
            sequence,
            event_type = %event.event_type,
            listeners_run,
            listener_failures,
            "dispatched event"
        );
        Ok(DispatchReport {
            sequence,
            listeners_run,
            listener_failures,
        })
    }

    fn run_listeners(
        &mut self,
        causes: &mut CauseStackManager,
        listeners: &[Arc<Listener>],
        event: &Event,
        cause: &Cause,
    ) -> Result<(usize, usize), JournalError> {
        let mut failures = 0;
        for listener in listeners {
            let mut frame = causes.push_cause_frame()?;
            frame.push_cause(listener.entry.clone())?;
            frame.add_context(&LISTENER, listener.name.clone())?;

            if let Err(error) = (listener.handler)(&mut *frame, self, event, cause) {
                failures += 1;
                tracing::warn!(
                    listener = %listener.name,
                    event_type = %event.event_type,
                    %error,
                    "event listener failed"
                );
            }
            frame.close()?;
        }
        Ok((listeners.len(), failures))
    }

    /// The journal of every event posted so far.
    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Mutable access, e.g. to clear the journal between ticks.
    pub fn journal_mut(&mut self) -> &mut EventJournal {
        &mut self.journal
    }

    /// Number of subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of posts currently in progress.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field(
                "listeners",
                &self.listeners.iter().map(|l| &l.name).collect::<Vec<_>>(),
            )
            .field("journal_len", &self.journal.len())
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_stack::prelude::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Player(&'static str);

    const BLOCK: ContextKey<u32> = ContextKey::new("block");

    // -- 1. Routing ---------------------------------------------------------

    #[test]
    fn post_runs_only_matching_listeners_in_order() {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = EventDispatcher::new();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        for (event_type, name) in [("a", "first"), ("b", "other"), ("a", "second")] {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe(event_type, name, move |_, _, _, _| {
                seen.lock().unwrap().push(name);
                Ok(())
            });
        }

        let report = dispatcher.post(&mut causes, Event::named("a")).unwrap();
        assert_eq!(report.listeners_run, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe("a", "gone", |_, _, _, _| Ok(()));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));

        let report = dispatcher.post(&mut causes, Event::named("a")).unwrap();
        assert_eq!(report.listeners_run, 0);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    // -- 2. Attribution -----------------------------------------------------

    #[test]
    fn listener_sees_itself_on_top_of_posting_cause() {
        let mut causes = CauseStackManager::new();
        causes.push_cause(CauseEntry::new(Player("alex"))).unwrap();
        let mut dispatcher = EventDispatcher::new();
        let observed: Arc<Mutex<Option<(String, Option<String>, usize)>>> = Arc::default();

        let sink = Arc::clone(&observed);
        dispatcher.subscribe("break", "logger", move |causes, _, _, posted| {
            let current = causes.get_current_cause()?;
            let name = current
                .first::<ListenerCause>()
                .map(|l| l.name.clone())
                .unwrap_or_default();
            let listener = causes.get_context(&LISTENER)?;
            *sink.lock().unwrap() = Some((name, listener, posted.len()));
            Ok(())
        });

        dispatcher.post(&mut causes, Event::named("break")).unwrap();
        let (name, listener, posted_len) = observed.lock().unwrap().take().unwrap();
        assert_eq!(name, "logger");
        assert_eq!(listener.as_deref(), Some("logger"));
        assert_eq!(posted_len, 1);

        // The listener's frame is gone.
        assert_eq!(causes.depth().unwrap(), 1);
        assert_eq!(causes.get_context(&LISTENER).unwrap(), None);
    }

    #[test]
    fn listener_changes_are_rolled_back() {
        let mut causes = CauseStackManager::new();
        causes.add_context(&BLOCK, 1).unwrap();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe("break", "messy", |causes, _, _, _| {
            causes.push_cause(CauseEntry::new("stray"))?;
            causes.add_context(&BLOCK, 99)?;
            Ok(())
        });

        dispatcher.post(&mut causes, Event::named("break")).unwrap();
        assert_eq!(causes.depth().unwrap(), 0);
        assert_eq!(causes.get_context(&BLOCK).unwrap(), Some(1));
    }

    // -- 3. Re-entrancy -----------------------------------------------------

    #[test]
    fn nested_post_is_attributed_to_listener() {
        let mut causes = CauseStackManager::new();
        causes.push_cause(CauseEntry::new(Player("alex"))).unwrap();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe("explosion", "chain", |causes, dispatcher, _, _| {
            dispatcher.post(causes, Event::named("block_break"))?;
            Ok(())
        });

        dispatcher.post(&mut causes, Event::named("explosion")).unwrap();

        let journal = dispatcher.journal();
        assert_eq!(journal.len(), 2);
        let outer = &journal.all_events()[0];
        let inner = &journal.all_events()[1];
        assert_eq!(outer.event.event_type, "explosion");
        assert_eq!(outer.depth, 0);
        assert_eq!(outer.listeners_run, 1);
        assert_eq!(inner.depth, 1);
        assert!(inner.cause.root().is_some_and(|r| r.is::<ListenerCause>()));
        assert_eq!(inner.cause.first::<Player>().map(|p| p.0), Some("alex"));
        assert_eq!(
            inner.cause.context().get(&LISTENER).unwrap().as_deref(),
            Some("chain")
        );
        assert_eq!(dispatcher.depth(), 0);
    }

    #[test]
    fn runaway_recursion_hits_depth_limit() {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = EventDispatcher::with_max_depth(3);
        let limit_hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&limit_hit);
        dispatcher.subscribe("echo", "echo", move |causes, dispatcher, event, _| {
            match dispatcher.post(causes, event.clone()) {
                Err(JournalError::ReentrancyLimit { limit, .. }) => {
                    assert_eq!(limit, 3);
                    *flag.lock().unwrap() = true;
                    Err("limit".into())
                }
                Err(other) => Err(other.into()),
                Ok(_) => Ok(()),
            }
        });

        dispatcher.post(&mut causes, Event::named("echo")).unwrap();
        assert!(*limit_hit.lock().unwrap());
        assert_eq!(dispatcher.journal().len(), 3);
        assert_eq!(causes.frame_depth().unwrap(), 0);
        assert_eq!(dispatcher.depth(), 0);
    }

    // -- 4. Failures --------------------------------------------------------

    #[test]
    fn failing_listener_is_counted_and_dispatch_continues() {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = EventDispatcher::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        dispatcher.subscribe("a", "broken", |_, _, _, _| Err("boom".into()));
        dispatcher.subscribe("a", "fine", move |_, _, _, _| {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        let report = dispatcher.post(&mut causes, Event::named("a")).unwrap();
        assert_eq!(report.listeners_run, 2);
        assert_eq!(report.listener_failures, 1);
        assert!(*ran.lock().unwrap());

        let entry = dispatcher.journal().get(report.sequence).unwrap();
        assert_eq!(entry.listener_failures, 1);
    }

    #[test]
    fn listener_leaking_a_frame_is_recovered() {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe("a", "leaky", |causes, _, _, _| {
            // Opened and never closed.
            let _leaked = causes.open_frame()?;
            causes.push_cause(CauseEntry::new("inside"))?;
            Ok(())
        });

        dispatcher.post(&mut causes, Event::named("a")).unwrap();
        assert_eq!(causes.frame_depth().unwrap(), 0);
        assert_eq!(causes.depth().unwrap(), 0);
    }
}
