//! Cause entries and immutable cause snapshots.
//!
//! A [`CauseEntry`] is an opaque, shared handle to any `'static` value. Entries
//! are compared by *identity*, not by value: two entries are equal only when
//! they point at the same allocation. This is what lets the cause stack
//! collapse a consecutive re-push of the same object into a duplicate count
//! while still treating two distinct `"zombie"` strings as separate causes.
//!
//! A [`Cause`] is the snapshot handed to event consumers. It lists entries
//! innermost (most recently pushed) first and carries the [`Context`] that was
//! current when it was taken.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;

// ---------------------------------------------------------------------------
// CauseObject
// ---------------------------------------------------------------------------

/// Any value that can be pushed onto the cause stack.
///
/// Implemented for every `'static + Debug + Send + Sync` type; there is no
/// need to implement it by hand.
pub trait CauseObject: Any + fmt::Debug + Send + Sync {
    /// Upcast to [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> CauseObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// CauseEntry
// ---------------------------------------------------------------------------

/// A single object on the cause stack.
///
/// Cloning an entry is cheap and preserves identity, so the clone compares
/// equal to the original.
#[derive(Clone)]
pub struct CauseEntry {
    object: Arc<dyn CauseObject>,
}

impl CauseEntry {
    /// Wrap a value in a fresh entry with its own identity.
    pub fn new<T: CauseObject>(value: T) -> Self {
        Self {
            object: Arc::new(value),
        }
    }

    /// Wrap an already shared value. Entries built from clones of the same
    /// `Arc` share identity.
    pub fn from_arc<T: CauseObject>(value: Arc<T>) -> Self {
        Self { object: value }
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        CauseObject::as_any(&*self.object).downcast_ref::<T>()
    }

    /// Whether the wrapped value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        CauseObject::as_any(&*self.object).is::<T>()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &CauseEntry) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<T: CauseObject> From<Arc<T>> for CauseEntry {
    fn from(value: Arc<T>) -> Self {
        Self::from_arc(value)
    }
}

impl PartialEq for CauseEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for CauseEntry {}

impl fmt::Debug for CauseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.object, f)
    }
}

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// An immutable snapshot of the cause stack, innermost entry first.
///
/// Produced by
/// [`CauseStackManager::get_current_cause`](crate::manager::CauseStackManager::get_current_cause)
/// and memoized until the next mutation, so repeated reads share the same
/// allocation.
#[derive(Clone, PartialEq)]
pub struct Cause {
    entries: Arc<[CauseEntry]>,
    context: Context,
}

impl Cause {
    /// Build a snapshot from entries ordered innermost first.
    pub fn new(entries: impl Into<Arc<[CauseEntry]>>, context: Context) -> Self {
        Self {
            entries: entries.into(),
            context,
        }
    }

    /// The innermost (most immediate) cause, if any.
    pub fn root(&self) -> Option<&CauseEntry> {
        self.entries.first()
    }

    /// The first entry, innermost first, whose value is a `T`.
    pub fn first<T: Any>(&self) -> Option<&T> {
        self.entries.iter().find_map(|e| e.downcast_ref::<T>())
    }

    /// Every entry whose value is a `T`, innermost first.
    pub fn all_of<T: Any>(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|e| e.downcast_ref::<T>())
    }

    /// Whether `entry` (by identity) is part of this cause.
    pub fn contains(&self, entry: &CauseEntry) -> bool {
        self.entries.iter().any(|e| e.ptr_eq(entry))
    }

    /// All entries, innermost first.
    pub fn entries(&self) -> &[CauseEntry] {
        &self.entries
    }

    /// Iterate entries, innermost first.
    pub fn iter(&self) -> impl Iterator<Item = &CauseEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cause has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The context that was current when this snapshot was taken.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Debug rendering of each entry, innermost first. Used by the event
    /// journal to produce serializable records.
    pub fn describe(&self) -> Vec<String> {
        self.entries.iter().map(|e| format!("{e:?}")).collect()
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cause")
            .field("entries", &self.entries)
            .field("context", &self.context)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
