//! The cause stack manager.
//!
//! [`CauseStackManager`] is the single mutable structure behind cause
//! attribution. It is owned by the simulation loop and handed by `&mut` to
//! every call site that produces or consumes attribution; there is no global
//! instance.
//!
//! # Operations
//!
//! | Producer side | Consumer side | Scoping |
//! |---------------|---------------|---------|
//! | [`push_cause`](CauseStackManager::push_cause) | [`get_current_cause`](CauseStackManager::get_current_cause) | [`push_cause_frame`](CauseStackManager::push_cause_frame) |
//! | [`pop_cause`](CauseStackManager::pop_cause) / [`pop_causes`](CauseStackManager::pop_causes) | [`get_current_context`](CauseStackManager::get_current_context) | [`open_frame`](CauseStackManager::open_frame) |
//! | [`add_context`](CauseStackManager::add_context) / [`remove_context`](CauseStackManager::remove_context) | [`peek_cause`](CauseStackManager::peek_cause) / [`get_context`](CauseStackManager::get_context) | [`pop_cause_frame`](CauseStackManager::pop_cause_frame) |
//!
//! Deferred providers are queued with
//! [`register_provider`](CauseStackManager::register_provider) and dropped
//! with [`release_provider`](CauseStackManager::release_provider).
//!
//! # Thread affinity
//!
//! Every operation first checks that it runs on the owning thread (or the
//! configured shutdown thread) and fails with
//! [`CauseError::ThreadAffinity`] otherwise. The check is the concurrency
//! control; there are no locks.
//!
//! # Snapshots
//!
//! Cause and context snapshots are memoized. Any mutation drops the memo and
//! the next read rebuilds it. A cause snapshot embeds the context snapshot,
//! so invalidating the context also invalidates the cause.

use std::any::Any;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::affinity::ThreadAffinity;
use crate::cause::{Cause, CauseEntry};
use crate::config::CauseStackConfig;
use crate::context::{Context, ContextKey, ContextObject, ContextStore, ContextValue};
use crate::frame::{
    CauseStackFrame, CorruptionReport, ForcedFrame, FrameClose, FrameHandle, FrameId,
    FrameRecord, ManagerId,
};
use crate::ledger::DuplicateLedger;
use crate::provider::{DeferredProviderQueue, PendingProvider, ProviderContext, Release};
use crate::CauseError;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// CauseStackManager
// ---------------------------------------------------------------------------

/// Cause stack, context store, frame stack and deferred providers.
pub struct CauseStackManager {
    id: ManagerId,
    config: CauseStackConfig,
    affinity: ThreadAffinity,
    /// Bottom of the stack first.
    causes: Vec<CauseEntry>,
    duplicates: DuplicateLedger,
    context: ContextStore,
    /// Outermost frame first.
    frames: Vec<FrameRecord>,
    /// Pops may not take the stack below this depth.
    min_depth: usize,
    next_frame: u64,
    /// Reported as the cause when the stack is empty.
    root: Option<CauseEntry>,
    cached_cause: Option<Cause>,
    cached_context: Option<Context>,
    providers: DeferredProviderQueue,
}

impl CauseStackManager {
    /// Create a manager bound to the calling thread with default config.
    pub fn new() -> Self {
        Self::with_config(CauseStackConfig::default())
    }

    /// Create a manager with config read from the environment.
    pub fn from_env() -> Self {
        Self::with_config(CauseStackConfig::from_env())
    }

    /// Create a manager bound to the calling thread.
    pub fn with_config(config: CauseStackConfig) -> Self {
        let affinity = ThreadAffinity::current(config.shutdown_thread_name.clone());
        Self {
            id: ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)),
            config,
            affinity,
            causes: Vec::new(),
            duplicates: DuplicateLedger::new(),
            context: ContextStore::default(),
            frames: Vec::new(),
            min_depth: 0,
            next_frame: 1,
            root: None,
            cached_cause: None,
            cached_context: None,
            providers: DeferredProviderQueue::default(),
        }
    }

    /// Report `root` as the cause whenever the stack is empty.
    pub fn with_root(mut self, root: impl Into<CauseEntry>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &CauseStackConfig {
        &self.config
    }

    pub(crate) fn manager_id(&self) -> ManagerId {
        self.id
    }

    // -- introspection ------------------------------------------------------

    /// Number of entries on the cause stack (duplicates not counted).
    pub fn depth(&self) -> Result<usize, CauseError> {
        self.affinity.check()?;
        Ok(self.causes.len())
    }

    /// Number of open frames.
    pub fn frame_depth(&self) -> Result<usize, CauseError> {
        self.affinity.check()?;
        Ok(self.frames.len())
    }

    /// The current floor for pops.
    pub fn min_depth(&self) -> Result<usize, CauseError> {
        self.affinity.check()?;
        Ok(self.min_depth)
    }

    /// Whether providers are waiting to be materialized.
    pub fn has_pending_providers(&self) -> Result<bool, CauseError> {
        self.affinity.check()?;
        Ok(self.providers.is_pending())
    }

    /// Number of providers waiting to be materialized.
    pub fn pending_provider_count(&self) -> Result<usize, CauseError> {
        self.affinity.check()?;
        Ok(self.providers.len())
    }

    // -- snapshots ----------------------------------------------------------

    /// Snapshot of the cause stack, innermost first.
    ///
    /// If the stack is empty the snapshot holds only the root set with
    /// [`with_root`](Self::with_root), or nothing.
    pub fn get_current_cause(&mut self) -> Result<Cause, CauseError> {
        self.enter()?;
        let context = self.context_snapshot();
        if let Some(cause) = &self.cached_cause {
            return Ok(cause.clone());
        }
        let entries: Vec<CauseEntry> = if self.causes.is_empty() {
            self.root.iter().cloned().collect()
        } else {
            self.causes.iter().rev().cloned().collect()
        };
        let cause = Cause::new(entries, context);
        self.cached_cause = Some(cause.clone());
        Ok(cause)
    }

    /// Snapshot of the context store.
    pub fn get_current_context(&mut self) -> Result<Context, CauseError> {
        self.enter()?;
        Ok(self.context_snapshot())
    }

    fn context_snapshot(&mut self) -> Context {
        self.cached_context
            .get_or_insert_with(|| self.context.snapshot())
            .clone()
    }

    // -- cause stack --------------------------------------------------------

    /// Push a cause. Re-pushing the entry already on top records a duplicate
    /// instead of growing the stack.
    pub fn push_cause(&mut self, cause: impl Into<CauseEntry>) -> Result<(), CauseError> {
        self.enter()?;
        let entry = cause.into();
        self.cached_cause = None;
        if self.causes.last().is_some_and(|top| top.ptr_eq(&entry)) {
            self.duplicates.increment(self.causes.len());
            return Ok(());
        }
        self.causes.push(entry);
        Ok(())
    }

    /// Pop the top cause. A recorded duplicate is consumed first, leaving the
    /// stack as is.
    ///
    /// Fails with [`CauseError::StackUnderflow`] if the pop would go below the
    /// innermost frame's floor; the stack is left untouched.
    pub fn pop_cause(&mut self) -> Result<CauseEntry, CauseError> {
        self.enter()?;
        self.pop_one(1)
    }

    /// Pop `n` causes. Availability is checked first, so on failure nothing
    /// is popped.
    pub fn pop_causes(&mut self, n: usize) -> Result<Vec<CauseEntry>, CauseError> {
        self.enter()?;
        if n > self.poppable() {
            return Err(CauseError::StackUnderflow {
                depth: self.causes.len(),
                floor: self.min_depth,
                requested: n,
            });
        }
        (0..n).map(|_| self.pop_one(n)).collect()
    }

    /// The top cause, if any.
    pub fn peek_cause(&mut self) -> Result<Option<CauseEntry>, CauseError> {
        self.enter()?;
        Ok(self.causes.last().cloned())
    }

    fn pop_one(&mut self, requested: usize) -> Result<CauseEntry, CauseError> {
        let size = self.causes.len();
        if let Some(top) = self.causes.last() {
            if self.duplicates.decrement(size) {
                return Ok(top.clone());
            }
        }
        if size <= self.min_depth {
            return Err(CauseError::StackUnderflow {
                depth: size,
                floor: self.min_depth,
                requested,
            });
        }
        self.cached_cause = None;
        self.causes.pop().ok_or(CauseError::StackUnderflow {
            depth: size,
            floor: self.min_depth,
            requested,
        })
    }

    /// How many single pops would succeed from the current state.
    fn poppable(&self) -> usize {
        let size = self.causes.len();
        let mut available = 0;
        if size > 0 {
            available += self.duplicates.get(self.min_depth) as usize;
        }
        for depth in (self.min_depth + 1)..=size {
            available += self.duplicates.get(depth) as usize + 1;
        }
        available
    }

    // -- context ------------------------------------------------------------

    /// Set a context value (last write wins). The value is stored as is;
    /// reads return clones of it.
    ///
    /// Inside a frame, the first write to a key records how to undo it: a key
    /// with no prior value is marked as introduced, otherwise its prior value
    /// is staged for restoration.
    pub fn add_context<T: ContextObject>(&mut self, key: &ContextKey<T>, value: T) -> Result<(), CauseError> {
        self.enter()?;
        self.invalidate_context();
        let previous = self.context.insert(key.key_id(), ContextValue::new(value));
        if let Some(frame) = self.frames.last_mut() {
            match previous {
                None => frame.mark_introduced(key.key_id()),
                Some(previous) => frame.stage_restore(key.key_id(), previous),
            }
        }
        Ok(())
    }

    /// Read a context value.
    ///
    /// Fails with [`CauseError::ContextType`] if the stored value is not a
    /// `T`.
    pub fn get_context<T: Any + Clone>(&mut self, key: &ContextKey<T>) -> Result<Option<T>, CauseError> {
        self.enter()?;
        self.context
            .get(key.id())
            .map(|value| key.view(value).cloned())
            .transpose()
    }

    /// Remove a context value and return it.
    ///
    /// Inside a frame, the removed value is staged for restoration unless the
    /// key was introduced within the innermost frame. A value of the wrong
    /// type is left in place.
    pub fn remove_context<T: Any + Clone>(&mut self, key: &ContextKey<T>) -> Result<Option<T>, CauseError> {
        self.enter()?;
        let Some(existing) = self.context.get(key.id()) else {
            return Ok(None);
        };
        let value = key.view(existing)?.clone();
        if let Some(removed) = self.context.remove(key.id()) {
            if let Some(frame) = self.frames.last_mut() {
                frame.stage_restore(key.key_id(), removed);
            }
        }
        self.invalidate_context();
        Ok(Some(value))
    }

    // -- frames -------------------------------------------------------------

    /// Open a frame and return a guard that closes it when dropped.
    #[track_caller]
    pub fn push_cause_frame(&mut self) -> Result<CauseStackFrame<'_>, CauseError> {
        let handle = self.open_frame()?;
        Ok(CauseStackFrame::new(self, handle))
    }

    /// Open a frame and return its raw handle. The caller must pass it to
    /// [`pop_cause_frame`](Self::pop_cause_frame) exactly once.
    #[track_caller]
    pub fn open_frame(&mut self) -> Result<FrameHandle, CauseError> {
        let origin = self.capture_origin(Location::caller());
        self.enter()?;
        Ok(self.open_frame_unchecked(origin))
    }

    fn open_frame_unchecked(&mut self, origin: Option<&'static Location<'static>>) -> FrameHandle {
        let depth = self.causes.len();
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.push(FrameRecord::new(
            id,
            self.min_depth,
            depth,
            self.duplicates.get(depth),
            origin,
        ));
        self.min_depth = depth;
        tracing::trace!(frame = %id, depth, "opened cause frame");
        FrameHandle::new(id, self.id)
    }

    /// Close a frame.
    ///
    /// If `handle` is the innermost frame, its context changes are undone,
    /// causes above its floor are popped and the floor and duplicate count it
    /// recorded are restored. If deeper frames leaked above it, they are
    /// closed first, innermost first, and a [`CorruptionReport`] is logged and
    /// returned. If the frame is not on the stack at all, nothing changes and
    /// [`CauseError::FrameNotFound`] is returned.
    pub fn pop_cause_frame(&mut self, handle: FrameHandle) -> Result<FrameClose, CauseError> {
        self.affinity.check()?;
        let target = handle.id();
        if handle.owner() != self.id {
            tracing::error!(frame = %target, "cause stack frame corruption: frame belongs to another manager");
            return Err(CauseError::ForeignFrame { frame: target });
        }
        let Some(position) = self.frames.iter().rposition(|f| f.id == target) else {
            tracing::error!(
                frame = %target,
                open_frames = self.frames.len(),
                "cause stack frame corruption: attempted to close a frame that is not on the stack"
            );
            return Err(CauseError::FrameNotFound { frame: target });
        };

        let offset = self.frames.len() - 1 - position;
        if offset == 0 {
            self.close_innermost();
            return Ok(FrameClose::Clean);
        }

        let closed: Vec<ForcedFrame> = (0..=offset)
            .filter_map(|_| self.close_innermost())
            .collect();
        let report = CorruptionReport {
            target,
            closed,
            verbose: self.config.verbose_frames,
        };
        tracing::error!(frame = %target, leaked = report.leaked(), "{report}");
        Ok(FrameClose::Recovered(report))
    }

    /// Pop the innermost frame and undo everything it tracked.
    fn close_innermost(&mut self) -> Option<ForcedFrame> {
        let mut frame = self.frames.pop()?;

        let mut context_changed = false;
        for key in frame.introduced.drain() {
            context_changed |= self.context.remove(&key).is_some();
        }
        for (key, value) in frame.overwritten.drain() {
            self.context.insert(key, value);
            context_changed = true;
        }
        if context_changed {
            self.invalidate_context();
        }

        while self.causes.len() > frame.opening_depth {
            self.duplicates.reset(self.causes.len());
            self.causes.pop();
            self.cached_cause = None;
        }
        self.min_depth = frame.saved_min_depth;
        self.duplicates.set(self.causes.len(), frame.saved_duplicates);

        tracing::trace!(frame = %frame.id, depth = self.causes.len(), "closed cause frame");
        Some(ForcedFrame::from(&frame))
    }

    // -- deferred providers -------------------------------------------------

    /// Queue a provider. Its frame is opened, and `populate` run, only when
    /// the cause or context is next observed or mutated.
    ///
    /// Returns the number of queued providers.
    #[track_caller]
    pub fn register_provider<F>(&mut self, context: ProviderContext, populate: F) -> Result<usize, CauseError>
    where
        F: FnOnce(&mut CauseStackManager, FrameHandle, &ProviderContext) + Send + 'static,
    {
        let origin = self.capture_origin(Location::caller());
        self.affinity.check()?;
        self.invalidate_context();
        Ok(self.providers.register(PendingProvider {
            context,
            populate: Box::new(populate),
            origin,
        }))
    }

    /// Drop a provider that was never materialized.
    ///
    /// Returns `false` if `context` was not queued, which is the normal case
    /// once its frame has been opened.
    pub fn release_provider(&mut self, context: &ProviderContext) -> Result<bool, CauseError> {
        self.affinity.check()?;
        match self.providers.release(context) {
            Release::NotQueued => Ok(false),
            Release::Removed { newest } => {
                if !newest {
                    tracing::warn!(
                        ?context,
                        remaining = self.providers.len(),
                        "released a cause provider that was not the most recently registered"
                    );
                }
                Ok(true)
            }
        }
    }

    /// Open a frame for each queued provider, oldest first, and populate it.
    fn materialize_pending(&mut self) {
        let Some(pending) = self.providers.take_pending() else {
            return;
        };
        tracing::debug!(providers = pending.len(), "materializing deferred cause providers");
        for provider in pending {
            let handle = self.open_frame_unchecked(provider.origin);
            (provider.populate)(self, handle, &provider.context);
        }
    }

    // -- internals ----------------------------------------------------------

    /// Entry gate for every operation that observes or mutates state.
    fn enter(&mut self) -> Result<(), CauseError> {
        self.affinity.check()?;
        self.materialize_pending();
        Ok(())
    }

    fn invalidate_context(&mut self) {
        self.cached_context = None;
        self.cached_cause = None;
    }

    fn capture_origin(&self, location: &'static Location<'static>) -> Option<&'static Location<'static>> {
        self.config.verbose_frames.then_some(location)
    }
}

impl Default for CauseStackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CauseStackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CauseStackManager")
            .field("causes", &self.causes)
            .field("frames", &self.frames.iter().map(|fr| fr.id).collect::<Vec<_>>())
            .field("min_depth", &self.min_depth)
            .field("context", &self.context)
            .field("providers", &self.providers)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
