//! Fixed-timestep tick loop with cause-attributed systems.
//!
//! The [`TickLoop`] owns the [`CauseStackManager`] and the
//! [`EventDispatcher`] and drives the simulation forward. Each tick:
//!
//! 1. The event journal is cleared.
//! 2. Every registered system runs in declaration order inside its own
//!    phase. The phase's provider pushes the system's [`SystemCause`] and
//!    sets the [`TICK`] context key, but only if the system (or a listener
//!    it triggers) actually observes the cause or context.
//! 3. Each phase is exited after its system returns, closing the frame or
//!    releasing the provider, and recovering any frames the system leaked.
//! 4. The tick counter and simulation time advance.
//!
//! # Example
//!
//! ```
//! use causeway_engine::tick::{TickConfig, TickLoop};
//! use causeway_journal::journal::Event;
//!
//! let config = TickConfig { fixed_dt: 1.0 / 60.0, ..Default::default() };
//! let mut tick_loop = TickLoop::new(config);
//!
//! // Register systems.
//! tick_loop.add_system("weather", |causes, dispatcher| {
//!     dispatcher.post(causes, Event::named("rain"))?;
//!     Ok(())
//! });
//!
//! // Run 10 ticks.
//! for _ in 0..10 {
//!     tick_loop.tick().unwrap();
//! }
//!
//! assert_eq!(tick_loop.tick_count(), 10);
//! ```

use std::time::{Duration, Instant};

use causeway_journal::dispatch::EventDispatcher;
use causeway_journal::journal::EventJournal;
use causeway_stack::cause::CauseEntry;
use causeway_stack::config::CauseStackConfig;
use causeway_stack::context::ContextKey;
use causeway_stack::manager::CauseStackManager;
use serde::{Deserialize, Serialize};

use crate::phase::{PhaseExit, PhaseTracker};
use crate::EngineError;

/// Context key holding the number of the tick being run.
pub const TICK: ContextKey<u64> = ContextKey::new("causeway.tick");

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep tick loop.
///
/// The `fixed_dt` is the duration in seconds of each simulation tick. A value
/// of `1.0 / 60.0` gives 60 ticks per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Configuration for the loop's cause stack manager.
    #[serde(default)]
    pub cause_stack: CauseStackConfig,
    /// Abort the tick with [`EngineError::SystemFailed`] when a system
    /// returns an error, instead of logging it and moving on.
    #[serde(default)]
    pub halt_on_system_error: bool,
}

impl Default for TickConfig {
    /// Defaults to 60 Hz (1/60 second per tick), system errors logged.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            cause_stack: CauseStackConfig::default(),
            halt_on_system_error: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and attribution diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    /// Total time for the tick.
    pub total_time: Duration,
    /// Systems whose phase frame was opened.
    pub materialized_phases: usize,
    /// Systems whose phase was released without a frame.
    pub released_phases: usize,
    /// Systems that leaked frames which had to be force-closed.
    pub recovered_phases: usize,
    /// `(system, error)` for every system that returned an error.
    pub system_failures: Vec<(String, String)>,
    /// Events journaled during the tick.
    pub events_dispatched: usize,
}

// ---------------------------------------------------------------------------
// System types
// ---------------------------------------------------------------------------

/// A system function run once per tick.
///
/// Systems receive the cause stack (with their own phase queued on it) and
/// the event dispatcher. Errors are reported through `anyhow` so systems can
/// use `?` on anything.
pub type SystemFn = fn(&mut CauseStackManager, &mut EventDispatcher) -> anyhow::Result<()>;

/// The cause pushed while a system's phase is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCause {
    pub name: String,
}

/// Reported as the cause when nothing else is on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineRoot;

/// A named system in the registry.
///
/// The `after` field lists the names of systems that must execute before
/// this system.
#[derive(Debug)]
struct RegisteredSystem {
    name: String,
    func: SystemFn,
    after: Vec<String>,
    /// Shared across ticks so every tick attributes to the same object.
    entry: CauseEntry,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The deterministic fixed-timestep tick loop.
///
/// Owns the only [`CauseStackManager`] of the simulation, so it must be
/// driven from the thread that created it (or the configured shutdown
/// thread).
pub struct TickLoop {
    causes: CauseStackManager,
    dispatcher: EventDispatcher,
    phases: PhaseTracker,
    /// Ordered list of systems to run each tick.
    systems: Vec<RegisteredSystem>,
    /// Number of ticks executed so far.
    tick_counter: u64,
    /// Fixed time step in seconds per tick.
    fixed_dt: f64,
    config: TickConfig,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Create a new tick loop bound to the calling thread.
    ///
    /// The tick counter starts at 0 and simulation time at 0.0.
    pub fn new(config: TickConfig) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        let causes = CauseStackManager::with_config(config.cause_stack.clone())
            .with_root(CauseEntry::new(EngineRoot));
        Self {
            causes,
            dispatcher: EventDispatcher::new(),
            phases: PhaseTracker::new(),
            systems: Vec::new(),
            tick_counter: 0,
            fixed_dt: config.fixed_dt,
            config,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Register a system to be run each tick.
    ///
    /// Systems are executed in the order they are registered.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, func: SystemFn) {
        self.add_system_after(name, &[], func);
    }

    /// Register a system with explicit execution dependencies.
    ///
    /// `after` lists system names that must execute before this system.
    ///
    /// # Panics
    ///
    /// - If any system in `after` is not already registered.
    /// - If a system with this name already exists.
    /// - If adding this system would create a dependency cycle.
    pub fn add_system_after(&mut self, name: &str, after: &[&str], func: SystemFn) {
        for dep in after {
            assert!(
                self.systems.iter().any(|s| s.name == *dep),
                "system '{name}' declares dependency on '{dep}', but '{dep}' is not registered"
            );
        }

        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );

        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func,
            after: after.iter().map(|s| s.to_string()).collect(),
            entry: CauseEntry::new(SystemCause {
                name: name.to_owned(),
            }),
        });

        self.validate_system_order();
    }

    /// Panics if the dependency graph has a cycle.
    fn validate_system_order(&self) {
        let mut visited = vec![false; self.systems.len()];
        let mut in_stack = vec![false; self.systems.len()];

        fn dfs(systems: &[RegisteredSystem], idx: usize, visited: &mut [bool], in_stack: &mut [bool]) -> bool {
            if in_stack[idx] {
                return false;
            }
            if visited[idx] {
                return true;
            }
            visited[idx] = true;
            in_stack[idx] = true;
            for dep_name in &systems[idx].after {
                if let Some(dep_idx) = systems.iter().position(|s| s.name == *dep_name) {
                    if !dfs(systems, dep_idx, visited, in_stack) {
                        return false;
                    }
                }
            }
            in_stack[idx] = false;
            true
        }

        for i in 0..self.systems.len() {
            assert!(
                dfs(&self.systems, i, &mut visited, &mut in_stack),
                "cycle detected in system dependencies"
            );
        }
    }

    /// Execute one simulation tick.
    ///
    /// Returns the number of events journaled during the tick. Cause stack
    /// errors raised by the loop's own bookkeeping abort the tick; system
    /// errors only do so with
    /// [`halt_on_system_error`](TickConfig::halt_on_system_error).
    pub fn tick(&mut self) -> Result<usize, EngineError> {
        let tick_start = Instant::now();
        let tick = self.tick_counter;
        let mut diagnostics = TickDiagnostics {
            system_times: Vec::with_capacity(self.systems.len()),
            ..Default::default()
        };
        self.dispatcher.journal_mut().clear();

        for system in &self.systems {
            let entry = system.entry.clone();
            let phase = self.phases.enter(&mut self.causes, system.name.as_str(), move |causes, _| {
                causes.push_cause(entry)?;
                causes.add_context(&TICK, tick)
            })?;

            let sys_start = Instant::now();
            let result = (system.func)(&mut self.causes, &mut self.dispatcher);
            diagnostics
                .system_times
                .push((system.name.clone(), sys_start.elapsed()));

            match self.phases.exit(&mut self.causes, phase)? {
                PhaseExit::Closed(close) => {
                    diagnostics.materialized_phases += 1;
                    if !close.is_clean() {
                        diagnostics.recovered_phases += 1;
                    }
                }
                PhaseExit::Released => diagnostics.released_phases += 1,
            }

            if let Err(error) = result {
                let details = format!("{error:#}");
                tracing::warn!(system = %system.name, tick, error = %details, "system failed");
                diagnostics.system_failures.push((system.name.clone(), details.clone()));
                if self.config.halt_on_system_error {
                    diagnostics.events_dispatched = self.dispatcher.journal().len();
                    diagnostics.total_time = tick_start.elapsed();
                    self.last_diagnostics = diagnostics;
                    return Err(EngineError::SystemFailed {
                        system: system.name.clone(),
                        tick,
                        details,
                    });
                }
            }
        }

        self.tick_counter += 1;
        diagnostics.events_dispatched = self.dispatcher.journal().len();
        diagnostics.total_time = tick_start.elapsed();
        let events = diagnostics.events_dispatched;
        self.last_diagnostics = diagnostics;
        Ok(events)
    }

    /// Run multiple ticks in sequence.
    ///
    /// Returns the total number of events journaled across all ticks.
    pub fn run_ticks(&mut self, count: u64) -> Result<u64, EngineError> {
        let mut total_events = 0u64;
        for _ in 0..count {
            total_events += self.tick()? as u64;
        }
        Ok(total_events)
    }

    // -- accessors ----------------------------------------------------------

    /// The number of ticks executed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// The current simulation time in seconds.
    ///
    /// Computed as `tick_count * fixed_dt` to avoid floating-point drift from
    /// repeated addition.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.fixed_dt
    }

    /// The fixed time step in seconds per tick.
    pub fn fixed_dt(&self) -> f64 {
        self.fixed_dt
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    /// Read-only access to the cause stack.
    pub fn causes(&self) -> &CauseStackManager {
        &self.causes
    }

    /// Mutable access to the cause stack, for setup and inspection between
    /// ticks.
    pub fn causes_mut(&mut self) -> &mut CauseStackManager {
        &mut self.causes
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Mutable access to the dispatcher, e.g. to subscribe listeners.
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// Events journaled during the last tick.
    pub fn journal(&self) -> &EventJournal {
        self.dispatcher.journal()
    }

    /// Phase counters over the lifetime of the loop.
    pub fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    /// The number of registered systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// The names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Diagnostics from the last tick.
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

impl std::fmt::Debug for TickLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickLoop")
            .field("systems", &self.system_names())
            .field("tick_counter", &self.tick_counter)
            .field("fixed_dt", &self.fixed_dt)
            .field("causes", &self.causes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
