//! Deferred cause providers.
//!
//! A phase of the simulation usually wants "everything that happens in me is
//! caused by X", but most phases finish without anyone asking. Rather than
//! open a frame and push X eagerly, the phase registers a provider: an opaque
//! [`ProviderContext`] plus a populate callback. The first time the cause or
//! context is observed afterwards, every queued provider gets its own frame,
//! oldest first, and its callback runs against the manager.
//!
//! The callback receives the [`FrameHandle`] by value. Whoever owns the
//! provider context is then responsible for closing that frame when the phase
//! ends. A phase that ends before anything was observed calls
//! [`CauseStackManager::release_provider`] instead and no frame is ever
//! opened.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::frame::FrameHandle;
use crate::manager::CauseStackManager;

// ---------------------------------------------------------------------------
// ProviderContext
// ---------------------------------------------------------------------------

/// Opaque, identity-compared handle to an external phase context.
///
/// The manager never looks inside; it only compares identities when a
/// provider is released.
#[derive(Clone)]
pub struct ProviderContext {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ProviderContext {
    /// Wrap a value in a context with its own identity.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Wrap an already shared value. Contexts built from clones of the same
    /// `Arc` share identity.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self { inner: value }
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).downcast_ref::<T>()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &ProviderContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ProviderContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ProviderContext {}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderContext({:p})", Arc::as_ptr(&self.inner))
    }
}

// ---------------------------------------------------------------------------
// DeferredProviderQueue
// ---------------------------------------------------------------------------

/// Callback that populates a freshly opened frame for a provider.
pub type PopulateFn = Box<dyn FnOnce(&mut CauseStackManager, FrameHandle, &ProviderContext) + Send>;

pub(crate) struct PendingProvider {
    pub(crate) context: ProviderContext,
    pub(crate) populate: PopulateFn,
    pub(crate) origin: Option<&'static Location<'static>>,
}

/// Outcome of releasing a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The context was not queued (already materialized or never registered).
    NotQueued,
    /// Removed; `newest` is false when it was not the most recent entry.
    Removed { newest: bool },
}

/// Providers waiting to be materialized, in registration order.
#[derive(Default)]
pub(crate) struct DeferredProviderQueue {
    entries: Vec<PendingProvider>,
    pending: bool,
}

impl DeferredProviderQueue {
    /// Queue a provider and return the queue length.
    pub(crate) fn register(&mut self, provider: PendingProvider) -> usize {
        self.entries.push(provider);
        self.pending = true;
        self.entries.len()
    }

    /// Remove the most recent entry for `context`.
    pub(crate) fn release(&mut self, context: &ProviderContext) -> Release {
        let Some(position) = self.entries.iter().rposition(|p| p.context.ptr_eq(context)) else {
            return Release::NotQueued;
        };
        let newest = position + 1 == self.entries.len();
        self.entries.remove(position);
        if self.entries.is_empty() {
            self.pending = false;
        }
        Release::Removed { newest }
    }

    /// Take every queued provider, oldest first, and clear the pending flag.
    /// Returns `None` if nothing is pending.
    pub(crate) fn take_pending(&mut self) -> Option<Vec<PendingProvider>> {
        if !std::mem::replace(&mut self.pending, false) {
            return None;
        }
        Some(std::mem::take(&mut self.entries))
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for DeferredProviderQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredProviderQueue")
            .field(
                "contexts",
                &self.entries.iter().map(|p| &p.context).collect::<Vec<_>>(),
            )
            .field("pending", &self.pending)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(context: &ProviderContext) -> PendingProvider {
        PendingProvider {
            context: context.clone(),
            populate: Box::new(
                |_: &mut CauseStackManager, _: FrameHandle, _: &ProviderContext| {},
            ),
            origin: None,
        }
    }

    #[test]
    fn contexts_compare_by_identity() {
        let a = ProviderContext::new("phase");
        let b = ProviderContext::new("phase");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast_ref::<&str>(), Some(&"phase"));
    }

    #[test]
    fn register_sets_pending_and_counts() {
        let mut queue = DeferredProviderQueue::default();
        assert!(!queue.is_pending());
        assert_eq!(queue.register(provider(&ProviderContext::new(1u8))), 1);
        assert_eq!(queue.register(provider(&ProviderContext::new(2u8))), 2);
        assert!(queue.is_pending());
    }

    #[test]
    fn take_pending_drains_oldest_first_once() {
        let mut queue = DeferredProviderQueue::default();
        let first = ProviderContext::new(1u8);
        let second = ProviderContext::new(2u8);
        queue.register(provider(&first));
        queue.register(provider(&second));

        let drained = queue.take_pending().unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].context.ptr_eq(&first));
        assert!(drained[1].context.ptr_eq(&second));
        assert!(queue.take_pending().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn release_clears_pending_when_empty() {
        let mut queue = DeferredProviderQueue::default();
        let first = ProviderContext::new(1u8);
        let second = ProviderContext::new(2u8);
        queue.register(provider(&first));
        queue.register(provider(&second));

        assert_eq!(queue.release(&first), Release::Removed { newest: false });
        assert!(queue.is_pending());
        assert_eq!(queue.release(&second), Release::Removed { newest: true });
        assert!(!queue.is_pending());
        assert_eq!(queue.release(&second), Release::NotQueued);
    }
}
