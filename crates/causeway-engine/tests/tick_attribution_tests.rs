//! Tick loop attribution tests: systems, listeners and phases working
//! together over several ticks.
//!
//! Validates that every event is attributed to the system (and listener)
//! that produced it, that systems which never look at the cause cost no
//! frame, and that whatever a system leaves behind is cleaned up at the end
//! of its phase.

use causeway_engine::prelude::*;

// -- Context keys -----------------------------------------------------------

const WEATHER: ContextKey<String> = ContextKey::new("weather");

// -- Systems ----------------------------------------------------------------

fn quiet_system(_: &mut CauseStackManager, _: &mut EventDispatcher) -> anyhow::Result<()> {
    Ok(())
}

fn weather_system(causes: &mut CauseStackManager, dispatcher: &mut EventDispatcher) -> anyhow::Result<()> {
    causes.add_context(&WEATHER, "rain".to_owned())?;
    dispatcher.post(causes, Event::new("rain", serde_json::json!({"mm": 3})))?;
    Ok(())
}

fn leaky_system(causes: &mut CauseStackManager, _: &mut EventDispatcher) -> anyhow::Result<()> {
    // Opened and never closed.
    let _leaked = causes.open_frame()?;
    causes.push_cause(CauseEntry::new("leaked"))?;
    Ok(())
}

fn stray_push_system(causes: &mut CauseStackManager, _: &mut EventDispatcher) -> anyhow::Result<()> {
    causes.push_cause(CauseEntry::new("stray"))?;
    causes.push_cause(CauseEntry::new("stray-2"))?;
    Ok(())
}

fn checking_system(causes: &mut CauseStackManager, _: &mut EventDispatcher) -> anyhow::Result<()> {
    let cause = causes.get_current_cause()?;
    anyhow::ensure!(
        cause.first::<&str>().is_none(),
        "saw a cause left behind by an earlier system: {cause:?}"
    );
    anyhow::ensure!(
        causes.get_context(&WEATHER)?.is_none(),
        "saw context left behind by an earlier system"
    );
    Ok(())
}

fn flood_listener(
    causes: &mut CauseStackManager,
    dispatcher: &mut EventDispatcher,
    _event: &Event,
    _cause: &Cause,
) -> Result<(), ListenerError> {
    dispatcher.post(causes, Event::named("flood"))?;
    Ok(())
}

// -- Tests ------------------------------------------------------------------

#[test]
fn nested_events_carry_system_and_listener() -> anyhow::Result<()> {
    let mut tick_loop = TickLoop::new(TickConfig::default());
    tick_loop.add_system("weather", weather_system);
    tick_loop
        .dispatcher_mut()
        .subscribe("rain", "flood_check", flood_listener);

    assert_eq!(tick_loop.tick()?, 2);

    let journal = tick_loop.journal();
    let rain = journal.events_of_type("rain").next().expect("rain journaled");
    let flood = journal.events_of_type("flood").next().expect("flood journaled");

    assert_eq!(rain.depth, 0);
    assert_eq!(rain.cause.first::<SystemCause>().map(|s| s.name.as_str()), Some("weather"));
    assert_eq!(rain.cause.context().get(&WEATHER)?.as_deref(), Some("rain"));
    assert_eq!(rain.cause.context().get(&TICK)?, Some(0));

    assert_eq!(flood.depth, 1);
    assert!(flood.cause.root().is_some_and(|r| r.is::<ListenerCause>()));
    assert_eq!(flood.cause.first::<SystemCause>().map(|s| s.name.as_str()), Some("weather"));
    assert_eq!(flood.cause.context().get(&LISTENER)?.as_deref(), Some("flood_check"));

    assert_eq!(journal.events_caused_by::<SystemCause>().count(), 2);
    assert_eq!(journal.events_with_root::<ListenerCause>().count(), 1);
    Ok(())
}

#[test]
fn quiet_systems_never_open_frames() -> anyhow::Result<()> {
    let mut tick_loop = TickLoop::new(TickConfig::default());
    for name in ["a", "b", "c"] {
        tick_loop.add_system(name, quiet_system);
    }
    tick_loop.run_ticks(10)?;

    let diag = tick_loop.last_diagnostics();
    assert_eq!(diag.released_phases, 3);
    assert_eq!(diag.materialized_phases, 0);

    let stats = tick_loop.phases().stats();
    assert_eq!(stats.entered, 30);
    assert_eq!(stats.released, 30);
    assert_eq!(stats.closed, 0);
    Ok(())
}

#[test]
fn later_systems_see_a_clean_stack() -> anyhow::Result<()> {
    let mut tick_loop = TickLoop::new(TickConfig {
        halt_on_system_error: true,
        ..Default::default()
    });
    tick_loop.add_system("weather", weather_system);
    tick_loop.add_system("leaky", leaky_system);
    tick_loop.add_system("stray", stray_push_system);
    tick_loop.add_system("check", checking_system);

    tick_loop.run_ticks(3)?;

    let diag = tick_loop.last_diagnostics();
    assert_eq!(diag.recovered_phases, 1);
    assert_eq!(diag.materialized_phases, 4);
    assert!(diag.system_failures.is_empty());
    assert_eq!(tick_loop.phases().stats().recovered, 3);

    let causes = tick_loop.causes_mut();
    assert_eq!(causes.frame_depth().unwrap(), 0);
    assert_eq!(causes.depth().unwrap(), 0);
    assert!(!causes.has_pending_providers().unwrap());
    Ok(())
}

#[test]
fn loop_rejects_use_from_another_thread() {
    let mut tick_loop = TickLoop::new(TickConfig {
        cause_stack: CauseStackConfig {
            shutdown_thread_name: None,
            ..Default::default()
        },
        ..Default::default()
    });
    tick_loop.add_system("weather", weather_system);

    let result = std::thread::spawn(move || tick_loop.tick())
        .join()
        .expect("thread panicked");
    assert!(matches!(
        result,
        Err(EngineError::Cause(CauseError::ThreadAffinity { .. }))
    ));
}

#[test]
fn verbose_frames_still_recover_leaks() -> anyhow::Result<()> {
    let mut tick_loop = TickLoop::new(TickConfig {
        cause_stack: CauseStackConfig {
            verbose_frames: true,
            ..Default::default()
        },
        ..Default::default()
    });
    tick_loop.add_system("leaky", leaky_system);
    tick_loop.tick()?;
    assert_eq!(tick_loop.last_diagnostics().recovered_phases, 1);
    Ok(())
}
