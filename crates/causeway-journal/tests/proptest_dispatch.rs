//! Property tests for event dispatch.
//!
//! These tests use `proptest` to wire random listener graphs (listener for
//! event `a` re-posts event `b`) and verify that dispatch always leaves the
//! cause stack as it found it, journals in post order, and attributes every
//! nested event to the listener that posted it.

use causeway_journal::prelude::*;
use causeway_stack::prelude::*;
use proptest::prelude::*;

const EVENT_TYPES: [&str; 4] = ["a", "b", "c", "d"];
const MAX_DEPTH: usize = 4;
const TICK: ContextKey<u64> = ContextKey::new("tick");

/// Wire listeners: for each `(from, to)`, a listener on `from` re-posts `to`.
fn wired_dispatcher(edges: &[(usize, usize)]) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::with_max_depth(MAX_DEPTH);
    for &(from, to) in edges {
        let target = EVENT_TYPES[to];
        dispatcher.subscribe(
            EVENT_TYPES[from],
            format!("{}->{}", EVENT_TYPES[from], target),
            move |causes, dispatcher, _, _| {
                causes.push_cause(CauseEntry::new(target))?;
                dispatcher.post(causes, Event::named(target))?;
                Ok(())
            },
        );
    }
    dispatcher
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Dispatch never leaks causes, context or frames, whatever the listener
    /// graph (cycles included).
    #[test]
    fn dispatch_leaves_stack_unchanged(
        edges in prop::collection::vec((0..4usize, 0..4usize), 0..5),
        posts in prop::collection::vec(0..4usize, 1..6),
        outer in 0usize..3,
    ) {
        let mut causes = CauseStackManager::new();
        for i in 0..outer {
            causes.push_cause(CauseEntry::new(i)).unwrap();
        }
        causes.add_context(&TICK, 7).unwrap();
        let cause_before = causes.get_current_cause().unwrap();
        let mut dispatcher = wired_dispatcher(&edges);

        for post in &posts {
            dispatcher.post(&mut causes, Event::named(EVENT_TYPES[*post])).unwrap();
            prop_assert_eq!(causes.get_current_cause().unwrap(), cause_before.clone());
            prop_assert_eq!(causes.frame_depth().unwrap(), 0);
            prop_assert_eq!(dispatcher.depth(), 0);
        }

        let journal = dispatcher.journal();
        let top_level = journal.all_events().iter().filter(|e| e.depth == 0).count();
        prop_assert_eq!(top_level, posts.len());
    }

    /// Every journaled event nested inside a listener carries that listener
    /// in its cause, and sequence numbers follow post order.
    #[test]
    fn nested_events_are_attributed_to_listeners(
        edges in prop::collection::vec((0..4usize, 0..4usize), 1..5),
        post in 0..4usize,
    ) {
        let mut causes = CauseStackManager::new();
        let mut dispatcher = wired_dispatcher(&edges);
        dispatcher.post(&mut causes, Event::named(EVENT_TYPES[post])).unwrap();

        let events = dispatcher.journal().all_events();
        for pair in events.windows(2) {
            prop_assert!(pair[0].sequence < pair[1].sequence);
        }
        for event in events {
            prop_assert!(event.depth < MAX_DEPTH);
            if event.depth > 0 {
                // The listener pushed the event type it re-posts.
                prop_assert_eq!(event.cause.first::<&str>(), Some(&event.event.event_type.as_str()));
                prop_assert!(event.cause.first::<ListenerCause>().is_some());
                prop_assert!(event.cause.context().contains_key("causeway.listener"));
            } else {
                prop_assert!(event.cause.is_empty());
            }
            let subscribed = edges
                .iter()
                .filter(|(from, _)| EVENT_TYPES[*from] == event.event.event_type)
                .count();
            prop_assert_eq!(event.listeners_run, subscribed);
        }
    }
}
