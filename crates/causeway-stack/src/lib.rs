//! Causeway Stack -- transactional cause and context attribution.
//!
//! This crate provides the causal context stack used by the Causeway engine
//! to answer "why did this side effect happen?" across deeply re-entrant call
//! chains. A single [`CauseStackManager`](manager::CauseStackManager) owns:
//!
//! - an ordered **cause stack** of arbitrary objects (innermost first when
//!   snapshotted), with a duplicate ledger that collapses consecutive pushes
//!   of the same object;
//! - a **context store** of typed key/value facts;
//! - a **frame stack** of checkpoints that roll both of the above back when
//!   closed, including recovery from frames closed out of order;
//! - a **deferred provider queue** whose frames are only opened once someone
//!   actually observes the cause or context.
//!
//! # Quick Start
//!
//! ```
//! use causeway_stack::prelude::*;
//!
//! const WORLD: ContextKey<String> = ContextKey::new("world");
//!
//! let mut causes = CauseStackManager::new();
//! causes.push_cause(CauseEntry::new("PlayerX")).unwrap();
//!
//! {
//!     let mut frame = causes.push_cause_frame().unwrap();
//!     frame.push_cause(CauseEntry::new("BlockBreak")).unwrap();
//!     frame.add_context(&WORLD, "overworld".to_owned()).unwrap();
//!
//!     let cause = frame.get_current_cause().unwrap();
//!     assert_eq!(cause.len(), 2);
//!     assert_eq!(cause.first::<&str>(), Some(&"BlockBreak"));
//! }
//!
//! // The frame rolled back everything pushed inside it.
//! let cause = causes.get_current_cause().unwrap();
//! assert_eq!(cause.len(), 1);
//! assert_eq!(causes.get_context(&WORLD).unwrap(), None);
//! ```

#![deny(unsafe_code)]

pub mod affinity;
pub mod cause;
pub mod config;
pub mod context;
pub mod frame;
pub mod ledger;
pub mod manager;
pub mod provider;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by cause stack operations.
///
/// Every variant reflects caller misuse rather than a transient condition,
/// so nothing here is worth retrying. Frames closed out of order are *not*
/// an error when the target frame is still on the stack; see
/// [`FrameClose::Recovered`](frame::FrameClose::Recovered).
#[derive(Debug, thiserror::Error)]
pub enum CauseError {
    /// The manager was used from a thread other than its owner or the
    /// designated shutdown thread.
    #[error("cause stack manager called off its owning thread (current='{current}', expected='{expected}')")]
    ThreadAffinity {
        current: String,
        expected: String,
    },

    /// A pop would reach below the floor of the innermost open frame.
    #[error("cause stack underflow: tried to pop {requested} cause(s) at depth {depth}, but the innermost frame's floor is {floor}")]
    StackUnderflow {
        depth: usize,
        floor: usize,
        requested: usize,
    },

    /// The frame being closed is not on the frame stack at all. Nothing was
    /// mutated.
    #[error("cause stack frame corruption: frame {frame} is not on the stack (already closed or never opened here)")]
    FrameNotFound {
        frame: frame::FrameId,
    },

    /// The frame handle was issued by a different manager.
    #[error("frame {frame} belongs to a different cause stack manager")]
    ForeignFrame {
        frame: frame::FrameId,
    },

    /// A context value was read through a key of a different type.
    #[error("context value for key '{key}' is a {found}, not a {expected}")]
    ContextType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl CauseError {
    /// Whether this error is the unrecoverable frame-corruption case.
    pub fn is_frame_corruption(&self) -> bool {
        matches!(
            self,
            CauseError::FrameNotFound { .. } | CauseError::ForeignFrame { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::affinity::ThreadAffinity;
    pub use crate::cause::{Cause, CauseEntry, CauseObject};
    pub use crate::config::CauseStackConfig;
    pub use crate::context::{Context, ContextKey, ContextObject};
    pub use crate::frame::{
        CauseStackFrame, CorruptionReport, ForcedFrame, FrameClose, FrameHandle, FrameId,
    };
    pub use crate::manager::CauseStackManager;
    pub use crate::provider::{PopulateFn, ProviderContext};
    pub use crate::CauseError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
