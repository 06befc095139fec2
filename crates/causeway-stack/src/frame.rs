//! Cause frames: checkpoints that roll back cause and context mutations.
//!
//! Opening a frame records the current stack floor and duplicate count and
//! raises the floor to the current depth. Every context key introduced or
//! overwritten while the frame is innermost is tracked in the frame, so that
//! closing it can delete the introduced keys, restore the overwritten ones and
//! pop any causes left above its floor.
//!
//! Two handle types exist:
//!
//! - [`FrameHandle`] is the raw, owned token returned by
//!   [`CauseStackManager::open_frame`](crate::manager::CauseStackManager::open_frame).
//!   It is neither `Clone` nor `Copy`, and closing consumes it, so a handle
//!   can be closed at most once. Ownership of the token can be handed to
//!   whatever outlives the current scope (a phase, a deferred provider).
//! - [`CauseStackFrame`] is a guard around a handle that closes it on drop
//!   and dereferences to the manager, so scoped code can keep using the
//!   manager through it.
//!
//! # Corruption
//!
//! Closing a frame that is not innermost means a deeper frame leaked. If the
//! target is still on the stack, every frame above it is force-closed first
//! and the close reports [`FrameClose::Recovered`]. If it is not on the stack
//! at all the close fails with
//! [`CauseError::FrameNotFound`](crate::CauseError::FrameNotFound) and nothing
//! changes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::context::{ContextValue, KeyId};
use crate::manager::CauseStackManager;
use crate::CauseError;

// ---------------------------------------------------------------------------
// FrameId
// ---------------------------------------------------------------------------

/// Identity of a frame, unique within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the manager that issued a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ManagerId(pub(crate) u64);

// ---------------------------------------------------------------------------
// FrameHandle
// ---------------------------------------------------------------------------

/// Owned token for an open frame. Pass it to
/// [`CauseStackManager::pop_cause_frame`] exactly once.
#[must_use = "an open frame must be closed with `pop_cause_frame`"]
#[derive(Debug, PartialEq, Eq)]
pub struct FrameHandle {
    id: FrameId,
    owner: ManagerId,
}

impl FrameHandle {
    pub(crate) fn new(id: FrameId, owner: ManagerId) -> Self {
        Self { id, owner }
    }

    /// The frame's id.
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn owner(&self) -> ManagerId {
        self.owner
    }
}

// ---------------------------------------------------------------------------
// FrameRecord
// ---------------------------------------------------------------------------

/// A frame as held on the manager's frame stack.
#[derive(Debug)]
pub(crate) struct FrameRecord {
    pub(crate) id: FrameId,
    /// `min_depth` before this frame raised it.
    pub(crate) saved_min_depth: usize,
    /// Stack depth when opened; the floor this frame enforces.
    pub(crate) opening_depth: usize,
    /// Duplicate count at `opening_depth` when opened.
    pub(crate) saved_duplicates: u32,
    /// Keys that had no value when first written inside this frame.
    pub(crate) introduced: HashSet<KeyId>,
    /// Keys overwritten or removed inside this frame, with their prior values.
    pub(crate) overwritten: HashMap<KeyId, ContextValue>,
    /// Where the frame was opened, when verbose diagnostics are on.
    pub(crate) origin: Option<&'static Location<'static>>,
}

impl FrameRecord {
    pub(crate) fn new(
        id: FrameId,
        saved_min_depth: usize,
        opening_depth: usize,
        saved_duplicates: u32,
        origin: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            id,
            saved_min_depth,
            opening_depth,
            saved_duplicates,
            introduced: HashSet::new(),
            overwritten: HashMap::new(),
            origin,
        }
    }

    pub(crate) fn is_tracked(&self, key: &str) -> bool {
        self.introduced.contains(key) || self.overwritten.contains_key(key)
    }

    /// Track a key that did not exist before this write. A key already staged
    /// for restoration stays staged instead, so a key is never in both sets.
    pub(crate) fn mark_introduced(&mut self, key: KeyId) {
        if !self.overwritten.contains_key(&key) {
            self.introduced.insert(key);
        }
    }

    /// Stage `previous` for restoration unless the key is already tracked.
    /// Only the first prior value seen by a frame is the one to restore.
    pub(crate) fn stage_restore(&mut self, key: KeyId, previous: ContextValue) {
        if !self.is_tracked(&key) {
            self.overwritten.insert(key, previous);
        }
    }
}

// ---------------------------------------------------------------------------
// FrameClose / CorruptionReport
// ---------------------------------------------------------------------------

/// Outcome of a successful frame close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameClose {
    /// The frame was innermost and closed normally.
    Clean,
    /// The frame was buried under leaked frames, which were force-closed
    /// first. The report has already been logged.
    Recovered(CorruptionReport),
}

impl FrameClose {
    pub fn is_clean(&self) -> bool {
        matches!(self, FrameClose::Clean)
    }
}

/// One frame closed during corruption recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedFrame {
    pub id: FrameId,
    /// `file:line:column` where the frame was opened, if captured.
    pub opened_at: Option<String>,
}

/// Diagnostic emitted when a frame is closed out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionReport {
    /// The frame the caller asked to close.
    pub target: FrameId,
    /// Every frame closed, innermost first. The last one is `target`.
    pub closed: Vec<ForcedFrame>,
    /// Whether call sites were being captured.
    pub verbose: bool,
}

impl CorruptionReport {
    /// Number of leaked frames that were closed on the target's behalf.
    pub fn leaked(&self) -> usize {
        self.closed.len().saturating_sub(1)
    }
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cause Stack Frame Corruption!")?;
        writeln!(
            f,
            "Closing frame {} found {} frame(s) left above it. Closing them all.",
            self.target,
            self.leaked()
        )?;
        for frame in &self.closed {
            match &frame.opened_at {
                Some(site) => writeln!(f, "  frame {} opened at {}", frame.id, site)?,
                None => writeln!(f, "  frame {}", frame.id)?,
            }
        }
        if !self.verbose {
            write!(
                f,
                "Set {}=true to record where each frame was opened.",
                crate::config::DEBUG_FRAMES_ENV
            )?;
        }
        Ok(())
    }
}

impl From<&FrameRecord> for ForcedFrame {
    fn from(record: &FrameRecord) -> Self {
        Self {
            id: record.id,
            opened_at: record.origin.map(|l| l.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// CauseStackFrame
// ---------------------------------------------------------------------------

/// Scoped frame guard. Closes its frame when dropped.
///
/// Dereferences to the [`CauseStackManager`], so everything done through the
/// guard is attributed inside the frame:
///
/// ```
/// use causeway_stack::prelude::*;
///
/// let mut causes = CauseStackManager::new();
/// {
///     let mut frame = causes.push_cause_frame().unwrap();
///     frame.push_cause(CauseEntry::new("explosion")).unwrap();
///     assert_eq!(frame.depth().unwrap(), 1);
/// }
/// assert_eq!(causes.depth().unwrap(), 0);
/// ```
///
/// Errors from the implicit close on drop are logged; call
/// [`close`](Self::close) to observe them.
pub struct CauseStackFrame<'a> {
    manager: &'a mut CauseStackManager,
    handle: Option<FrameHandle>,
    id: FrameId,
}

impl<'a> CauseStackFrame<'a> {
    pub(crate) fn new(manager: &'a mut CauseStackManager, handle: FrameHandle) -> Self {
        let id = handle.id();
        Self {
            manager,
            handle: Some(handle),
            id,
        }
    }

    /// The guarded frame's id.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Close the frame now and report how it went.
    pub fn close(mut self) -> Result<FrameClose, CauseError> {
        match self.handle.take() {
            Some(handle) => self.manager.pop_cause_frame(handle),
            None => Err(CauseError::FrameNotFound { frame: self.id }),
        }
    }

    /// Give up the guard without closing, returning the raw handle. The
    /// caller becomes responsible for closing it.
    pub fn into_handle(mut self) -> FrameHandle {
        // `handle` is only taken by `close`, `into_handle` and `drop`, all of
        // which consume the guard.
        match self.handle.take() {
            Some(handle) => handle,
            None => FrameHandle::new(self.id, self.manager.manager_id()),
        }
    }
}

impl Deref for CauseStackFrame<'_> {
    type Target = CauseStackManager;

    fn deref(&self) -> &CauseStackManager {
        self.manager
    }
}

impl DerefMut for CauseStackFrame<'_> {
    fn deref_mut(&mut self) -> &mut CauseStackManager {
        self.manager
    }
}

impl Drop for CauseStackFrame<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(error) = self.manager.pop_cause_frame(handle) {
                tracing::error!(frame = %self.id, %error, "failed to close cause frame on drop");
            }
        }
    }
}

impl fmt::Debug for CauseStackFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CauseStackFrame")
            .field("id", &self.id)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn key(id: &'static str) -> KeyId {
        Cow::Borrowed(id)
    }

    fn staged(record: &FrameRecord, key: &str) -> Option<u32> {
        record.overwritten.get(key).and_then(|v| v.downcast_ref::<u32>()).copied()
    }

    #[test]
    fn introduced_and_overwritten_are_disjoint() {
        let mut record = FrameRecord::new(FrameId(1), 0, 0, 0, None);

        record.stage_restore(key("a"), ContextValue::new(1u32));
        record.mark_introduced(key("a"));
        assert!(!record.introduced.contains("a"));
        assert_eq!(staged(&record, "a"), Some(1));

        record.mark_introduced(key("b"));
        record.stage_restore(key("b"), ContextValue::new(2u32));
        assert!(record.introduced.contains("b"));
        assert!(!record.overwritten.contains_key("b"));
    }

    #[test]
    fn first_prior_value_wins() {
        let mut record = FrameRecord::new(FrameId(1), 0, 0, 0, None);
        let first = ContextValue::new(1u32);
        record.stage_restore(key("a"), first.clone());
        record.stage_restore(key("a"), ContextValue::new(2u32));
        assert!(record.overwritten.get("a").is_some_and(|v| v.ptr_eq(&first)));
    }

    #[test]
    fn report_rendering() {
        let report = CorruptionReport {
            target: FrameId(1),
            closed: vec![
                ForcedFrame {
                    id: FrameId(3),
                    opened_at: Some("src/lib.rs:10:5".to_owned()),
                },
                ForcedFrame {
                    id: FrameId(2),
                    opened_at: None,
                },
                ForcedFrame {
                    id: FrameId(1),
                    opened_at: None,
                },
            ],
            verbose: false,
        };
        assert_eq!(report.leaked(), 2);

        let text = report.to_string();
        assert!(text.starts_with("Cause Stack Frame Corruption!"));
        assert!(text.contains("found 2 frame(s)"));
        assert!(text.contains("frame #3 opened at src/lib.rs:10:5"));
        assert!(text.contains(crate::config::DEBUG_FRAMES_ENV));
    }
}
