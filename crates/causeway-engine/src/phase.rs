//! Lazily attributed simulation phases.
//!
//! A phase says "everything that happens while I am open is caused by X".
//! Most phases end without anyone looking at the cause, so
//! [`PhaseTracker::enter`] only registers a deferred provider. If the cause
//! or context is observed while the phase is open, the provider's frame is
//! opened and populated, and its handle is parked in the phase.
//! [`PhaseTracker::exit`] then closes that frame, or releases the provider if
//! it never materialized.
//!
//! # Example
//!
//! ```
//! use causeway_engine::phase::{PhaseExit, PhaseTracker};
//! use causeway_stack::prelude::*;
//!
//! let mut causes = CauseStackManager::new();
//! let mut phases = PhaseTracker::new();
//!
//! // Nobody looks: no frame is ever opened.
//! let quiet = phases
//!     .enter(&mut causes, "quiet", |causes, name| causes.push_cause(CauseEntry::new(name.to_owned())))
//!     .unwrap();
//! assert!(matches!(phases.exit(&mut causes, quiet).unwrap(), PhaseExit::Released));
//!
//! // Somebody looks: the phase is on the cause while open.
//! let busy = phases
//!     .enter(&mut causes, "busy", |causes, name| causes.push_cause(CauseEntry::new(name.to_owned())))
//!     .unwrap();
//! let cause = causes.get_current_cause().unwrap();
//! assert_eq!(cause.first::<String>().map(String::as_str), Some("busy"));
//! assert!(matches!(phases.exit(&mut causes, busy).unwrap(), PhaseExit::Closed(_)));
//! assert!(causes.get_current_cause().unwrap().is_empty());
//! ```

use std::sync::Arc;

use causeway_stack::frame::{FrameClose, FrameHandle};
use causeway_stack::manager::CauseStackManager;
use causeway_stack::provider::ProviderContext;
use causeway_stack::CauseError;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Shared between the phase and its provider callback.
#[derive(Debug)]
struct PhaseState {
    name: String,
    frame: Mutex<Option<FrameHandle>>,
}

/// An open phase. Pass it back to [`PhaseTracker::exit`] exactly once.
#[must_use = "a phase must be exited, or its provider frame stays open"]
#[derive(Debug)]
pub struct Phase {
    state: Arc<PhaseState>,
    context: ProviderContext,
}

impl Phase {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether the phase's frame has been opened.
    pub fn is_materialized(&self) -> bool {
        self.state.frame.lock().is_some()
    }
}

/// How a phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseExit {
    /// The phase materialized and its frame was closed.
    Closed(FrameClose),
    /// The phase never materialized; its provider was released.
    Released,
}

impl PhaseExit {
    /// Whether frames leaked inside the phase had to be force-closed.
    pub fn recovered(&self) -> bool {
        matches!(self, PhaseExit::Closed(FrameClose::Recovered(_)))
    }
}

/// Counters over every phase the tracker has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseStats {
    pub entered: u64,
    pub closed: u64,
    pub released: u64,
    pub recovered: u64,
}

// ---------------------------------------------------------------------------
// PhaseTracker
// ---------------------------------------------------------------------------

/// Opens and closes phases against a [`CauseStackManager`].
#[derive(Debug, Default)]
pub struct PhaseTracker {
    open: Vec<String>,
    stats: PhaseStats,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a phase named `name`.
    ///
    /// `populate` runs inside the phase's frame the first time the cause or
    /// context is observed while the phase is queued. An error from it is
    /// logged; the frame stays open either way so that [`exit`](Self::exit)
    /// can close it.
    pub fn enter<F>(
        &mut self,
        causes: &mut CauseStackManager,
        name: impl Into<String>,
        populate: F,
    ) -> Result<Phase, CauseError>
    where
        F: FnOnce(&mut CauseStackManager, &str) -> Result<(), CauseError> + Send + 'static,
    {
        let state = Arc::new(PhaseState {
            name: name.into(),
            frame: Mutex::new(None),
        });
        let context = ProviderContext::from_arc(Arc::clone(&state));

        let sink = Arc::clone(&state);
        causes.register_provider(context.clone(), move |manager, frame, _| {
            if let Err(error) = populate(manager, &sink.name) {
                tracing::error!(phase = %sink.name, %error, "failed to populate phase frame");
            }
            *sink.frame.lock() = Some(frame);
        })?;

        self.open.push(state.name.clone());
        self.stats.entered += 1;
        Ok(Phase { state, context })
    }

    /// Close `phase`: pop its frame if it materialized, otherwise release
    /// its provider.
    ///
    /// The phase is no longer open afterwards, even when closing its frame
    /// fails (e.g. the frame was already force-closed by an outer phase).
    pub fn exit(&mut self, causes: &mut CauseStackManager, phase: Phase) -> Result<PhaseExit, CauseError> {
        self.forget(phase.name());

        let frame = phase.state.frame.lock().take();
        let exit = match frame {
            Some(handle) => {
                let close = causes.pop_cause_frame(handle)?;
                self.stats.closed += 1;
                PhaseExit::Closed(close)
            }
            None => {
                if !causes.release_provider(&phase.context)? {
                    tracing::debug!(phase = %phase.name(), "phase provider was already gone at exit");
                }
                self.stats.released += 1;
                PhaseExit::Released
            }
        };
        if exit.recovered() {
            self.stats.recovered += 1;
        }
        Ok(exit)
    }

    fn forget(&mut self, name: &str) {
        let Some(position) = self.open.iter().rposition(|n| n == name) else {
            return;
        };
        if position + 1 != self.open.len() {
            tracing::warn!(phase = %name, open = ?self.open, "phase exited out of order");
        }
        self.open.remove(position);
    }

    /// Names of the phases currently open, outermost first.
    pub fn open_phases(&self) -> &[String] {
        &self.open
    }

    pub fn stats(&self) -> PhaseStats {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
