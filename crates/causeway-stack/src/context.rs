//! Typed context keys, the mutable context store and immutable snapshots.
//!
//! Context values are auxiliary facts about the current action ("which world",
//! "which tool was used") that are not part of the ordered cause chain. Each
//! [`ContextKey<T>`] carries its value type as a phantom parameter so reads and
//! writes are type-checked at the call site.
//!
//! Values are stored as they were given, behind a shared [`ContextObject`]
//! handle, the same way [`CauseEntry`](crate::cause::CauseEntry) holds causes.
//! Snapshots share those handles, so a value read back is the instance that
//! was stored. `serde_json` is only used to render snapshots for the event
//! journal.

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::CauseError;

/// Identifier type shared by the store, frames and snapshots.
pub(crate) type KeyId = Cow<'static, str>;

// ---------------------------------------------------------------------------
// ContextObject
// ---------------------------------------------------------------------------

/// Any value that can be stored in the context.
///
/// Implemented for every `'static + Debug + Serialize + Send + Sync` type.
pub trait ContextObject: Any + fmt::Debug + Send + Sync {
    /// Upcast to [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Name of the concrete type, for mismatch errors.
    fn type_name(&self) -> &'static str;

    /// JSON rendering for export. Values JSON cannot represent fall back to
    /// their `Debug` text.
    fn to_json(&self) -> serde_json::Value;
}

impl<T: Any + fmt::Debug + Serialize + Send + Sync> ContextObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::String(format!("{self:?}")))
    }
}

/// A stored context value. Clones share the value.
#[derive(Clone)]
pub(crate) struct ContextValue {
    object: Arc<dyn ContextObject>,
}

impl ContextValue {
    pub(crate) fn new<T: ContextObject>(value: T) -> Self {
        Self {
            object: Arc::new(value),
        }
    }

    pub(crate) fn downcast_ref<T: Any>(&self) -> Option<&T> {
        ContextObject::as_any(&*self.object).downcast_ref::<T>()
    }

    pub(crate) fn ptr_eq(&self, other: &ContextValue) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        ContextObject::to_json(&*self.object)
    }
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.object, f)
    }
}

// ---------------------------------------------------------------------------
// ContextKey
// ---------------------------------------------------------------------------

/// A typed identifier for a context value.
///
/// Keys compare by their string id; two keys with the same id address the
/// same slot regardless of `T`.
///
/// ```
/// use causeway_stack::context::ContextKey;
///
/// const WORLD: ContextKey<String> = ContextKey::new("world");
/// assert_eq!(WORLD.id(), "world");
/// ```
pub struct ContextKey<T> {
    id: KeyId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    /// A key with a static id, usable in `const` items.
    pub const fn new(id: &'static str) -> Self {
        Self {
            id: Cow::Borrowed(id),
            _marker: PhantomData,
        }
    }

    /// A key with an id built at runtime.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: Cow::Owned(id.into()),
            _marker: PhantomData,
        }
    }

    /// The key's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn key_id(&self) -> KeyId {
        self.id.clone()
    }
}

impl<T: Any> ContextKey<T> {
    /// Borrow `value` as this key's type.
    pub(crate) fn view<'v>(&self, value: &'v ContextValue) -> Result<&'v T, CauseError> {
        value.downcast_ref::<T>().ok_or_else(|| CauseError::ContextType {
            key: self.id().to_owned(),
            expected: type_name::<T>(),
            found: ContextObject::type_name(&*value.object),
        })
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for ContextKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextKey").field(&self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// The live key/value store behind the manager. At most one value per key;
/// writes are last-write-wins.
#[derive(Debug, Default)]
pub(crate) struct ContextStore {
    values: HashMap<KeyId, ContextValue>,
}

impl ContextStore {
    /// Insert a value, returning the one it replaced.
    pub(crate) fn insert(&mut self, key: KeyId, value: ContextValue) -> Option<ContextValue> {
        self.values.insert(key, value)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.values.remove(key)
    }

    pub(crate) fn snapshot(&self) -> Context {
        Context {
            values: Arc::new(
                self.values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// An immutable snapshot of the context store.
///
/// Two snapshots are equal when they hold the same value instances under the
/// same keys. Keys are kept sorted so that rendering is stable.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<BTreeMap<KeyId, ContextValue>>,
}

impl Context {
    /// Typed lookup, returning a clone of the stored value. For an `Arc`
    /// value the clone shares the stored instance.
    pub fn get<T: Any + Clone>(&self, key: &ContextKey<T>) -> Result<Option<T>, CauseError> {
        Ok(self.get_ref(key)?.cloned())
    }

    /// Typed lookup by reference.
    pub fn get_ref<T: Any>(&self, key: &ContextKey<T>) -> Result<Option<&T>, CauseError> {
        self.values
            .get(key.id())
            .map(|value| key.view(value))
            .transpose()
    }

    /// Whether a value is present for `id`.
    pub fn contains_key(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    /// Key ids in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Render the snapshot as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
            || (self.values.len() == other.values.len()
                && self
                    .values
                    .iter()
                    .zip(other.values.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && va.ptr_eq(vb)))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
