//! Causeway Engine -- simulation driver with cause-attributed system phases.
//!
//! This crate builds on [`causeway_stack`] and [`causeway_journal`] to
//! provide the simulation driver: a fixed-timestep tick loop that owns the
//! [`CauseStackManager`](causeway_stack::manager::CauseStackManager), runs
//! systems in a deterministic order, and attributes everything each system
//! does to that system through a lazily materialized phase.
//!
//! # Quick Start
//!
//! ```
//! use causeway_engine::prelude::*;
//!
//! let config = TickConfig { fixed_dt: 1.0 / 60.0, ..Default::default() };
//! let mut tick_loop = TickLoop::new(config);
//!
//! tick_loop.add_system("spawner", |causes, dispatcher| {
//!     // Anything posted here is attributed to the "spawner" system.
//!     dispatcher.post(causes, Event::named("spawn"))?;
//!     Ok(())
//! });
//!
//! tick_loop.run_ticks(100).unwrap();
//! assert_eq!(tick_loop.tick_count(), 100);
//! ```

#![deny(unsafe_code)]

pub mod logging;
pub mod phase;
pub mod tick;

use causeway_journal::JournalError;
use causeway_stack::CauseError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the cause stack crate for convenience.
pub use causeway_stack;

/// Re-export the journal crate for convenience.
pub use causeway_journal;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the simulation driver.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A cause stack operation issued by the loop itself failed.
    #[error(transparent)]
    Cause(#[from] CauseError),

    /// Event dispatch failed.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// A system returned an error and the loop is configured to halt on
    /// system errors.
    #[error("system '{system}' failed at tick {tick}: {details}")]
    SystemFailed {
        system: String,
        tick: u64,
        details: String,
    },

    /// The logging filter could not be built.
    #[error("invalid log directive '{directive}': {details}")]
    LogDirective {
        directive: String,
        details: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export the core and journal preludes.
    pub use causeway_journal::prelude::*;
    pub use causeway_stack::prelude::*;

    // Engine-specific exports.
    pub use crate::logging::{init_logging, LoggingConfig};
    pub use crate::phase::{Phase, PhaseExit, PhaseStats, PhaseTracker};
    pub use crate::tick::{EngineRoot, SystemCause, SystemFn, TickConfig, TickDiagnostics, TickLoop, TICK};
    pub use crate::EngineError;
}
