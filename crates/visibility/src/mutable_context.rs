//! Request-scoped mutable values layered over the immutable [`Context`].
//!
//! Each [`fork`] attaches a new node whose parent is the node already carried
//! by the context. Reads fall through from the nearest node to the root;
//! writes always land on the nearest node. Every node has its own lock, and
//! parent links never change after creation, so a lookup never holds more than
//! one lock at a time.
//!
//! # Example
//!
//! ```rust
//! use opentelemetry::Context;
//! use visibility::mutable_context::{self, ContextKey};
//!
//! let tenant = ContextKey::<String>::new("tenant");
//!
//! let root = mutable_context::fork(&Context::new());
//! mutable_context::set(&root, &tenant, "acme".to_string()).unwrap();
//!
//! let child = mutable_context::fork(&root);
//! assert_eq!(mutable_context::must_get(&child, &tenant).unwrap(), "acme");
//! ```

use crate::error::{Result, VisibilityError};
use opentelemetry::Context;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Typed handle to a slot in the mutable context.
///
/// Keys are compared by identity: two keys created with the same name are
/// distinct slots. Reusing a name is legal but makes diagnostics ambiguous.
pub struct ContextKey<V> {
    id: u64,
    name: &'static str,
    _value: PhantomData<fn() -> V>,
}

impl<V> ContextKey<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> fmt::Debug for ContextKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

type Slot = Box<dyn Any + Send + Sync>;

struct Node {
    parent: Option<Arc<Node>>,
    values: Mutex<HashMap<u64, Slot>>,
}

impl Node {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The context entry holding the nearest node.
#[derive(Clone)]
struct MutableLayer(Arc<Node>);

fn nearest(cx: &Context) -> Result<&Arc<Node>> {
    cx.get::<MutableLayer>()
        .map(|layer| &layer.0)
        .ok_or(VisibilityError::NoMutableContext)
}

/// Returns true if `cx` has been forked at least once.
pub fn has_mutable_context(cx: &Context) -> bool {
    cx.get::<MutableLayer>().is_some()
}

/// Derive a context carrying a fresh node layered over the one in `cx`.
pub fn fork(cx: &Context) -> Context {
    let parent = cx.get::<MutableLayer>().map(|layer| Arc::clone(&layer.0));
    cx.with_value(MutableLayer(Arc::new(Node {
        parent,
        values: Mutex::new(HashMap::new()),
    })))
}

/// Store `value` at the nearest node, shadowing any ancestor value.
///
/// # Errors
///
/// Returns `VisibilityError::NoMutableContext` if `cx` was never forked.
pub fn set<V>(cx: &Context, key: &ContextKey<V>, value: V) -> Result<()>
where
    V: Clone + Send + Sync + 'static,
{
    let node = nearest(cx)?;
    node.lock().insert(key.id, Box::new(value));
    Ok(())
}

/// Atomically rewrite the value at the nearest node.
///
/// `editor` receives the nearest node's own value (`None` if that node does
/// not hold the key, even when an ancestor does) and returns the replacement;
/// `None` removes the key. It runs under the node lock and must not touch the
/// mutable context itself.
///
/// # Errors
///
/// Returns `VisibilityError::NoMutableContext` if `cx` was never forked.
pub fn edit<V, F>(cx: &Context, key: &ContextKey<V>, editor: F) -> Result<()>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce(Option<V>) -> Option<V>,
{
    let node = nearest(cx)?;
    let mut values = node.lock();

    let current = values
        .remove(&key.id)
        .and_then(|slot| slot.downcast::<V>().ok())
        .map(|boxed| *boxed);

    if let Some(updated) = editor(current) {
        values.insert(key.id, Box::new(updated));
    }
    Ok(())
}

/// Look `key` up from the nearest node towards the root.
///
/// # Errors
///
/// Returns `VisibilityError::NoMutableContext` if `cx` was never forked.
pub fn try_get<V>(cx: &Context, key: &ContextKey<V>) -> Result<Option<V>>
where
    V: Clone + Send + Sync + 'static,
{
    let mut node = Some(nearest(cx)?);

    while let Some(current) = node {
        let found = current
            .lock()
            .get(&key.id)
            .and_then(|slot| slot.downcast_ref::<V>())
            .cloned();
        if found.is_some() {
            return Ok(found);
        }
        // Parent links are immutable, no lock needed to follow them.
        node = current.parent.as_ref();
    }

    Ok(None)
}

/// Like [`try_get`], but a missing value is an error.
///
/// # Errors
///
/// Returns `VisibilityError::NoMutableContext` if `cx` was never forked, or
/// `VisibilityError::ValueNotFound` if no node holds `key`.
pub fn must_get<V>(cx: &Context, key: &ContextKey<V>) -> Result<V>
where
    V: Clone + Send + Sync + 'static,
{
    try_get(cx, key)?.ok_or(VisibilityError::ValueNotFound { key: key.name })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_missing_layer_is_an_error() {
        let key = ContextKey::<String>::new("missing");
        let cx = Context::new();

        assert!(!has_mutable_context(&cx));
        assert_eq!(
            set(&cx, &key, "x".to_string()),
            Err(VisibilityError::NoMutableContext)
        );
        assert_eq!(try_get(&cx, &key), Err(VisibilityError::NoMutableContext));
        assert_eq!(must_get(&cx, &key), Err(VisibilityError::NoMutableContext));
        assert_eq!(
            edit(&cx, &key, |v| v),
            Err(VisibilityError::NoMutableContext)
        );
    }

    #[test]
    fn test_child_write_does_not_leak_to_root() {
        let key = ContextKey::<String>::new("k");

        let root = fork(&Context::new());
        set(&root, &key, "a".to_string()).unwrap();

        let child = fork(&root);
        assert_eq!(must_get(&child, &key).unwrap(), "a");

        set(&child, &key, "b".to_string()).unwrap();
        assert_eq!(must_get(&child, &key).unwrap(), "b");
        assert_eq!(must_get(&root, &key).unwrap(), "a");
    }

    #[test]
    fn test_root_value_visible_through_deep_chain() {
        let key = ContextKey::<u32>::new("depth");
        let root = fork(&Context::new());
        set(&root, &key, 7).unwrap();

        let mut cx = root.clone();
        for _ in 0..16 {
            cx = fork(&cx);
            assert_eq!(try_get(&cx, &key).unwrap(), Some(7));
        }
    }

    #[test]
    fn test_siblings_are_isolated() {
        let key = ContextKey::<&'static str>::new("sibling");
        let root = fork(&Context::new());
        let left = fork(&root);
        let right = fork(&root);

        set(&left, &key, "left").unwrap();

        assert_eq!(try_get(&left, &key).unwrap(), Some("left"));
        assert_eq!(try_get(&right, &key).unwrap(), None);
        assert_eq!(try_get(&root, &key).unwrap(), None);
        assert_eq!(
            must_get(&right, &key),
            Err(VisibilityError::ValueNotFound { key: "sibling" })
        );
    }

    #[test]
    fn test_keys_with_same_name_are_distinct() {
        let first = ContextKey::<String>::new("dup");
        let second = ContextKey::<String>::new("dup");
        let cx = fork(&Context::new());

        set(&cx, &first, "one".to_string()).unwrap();

        assert_eq!(try_get(&cx, &first).unwrap().as_deref(), Some("one"));
        assert_eq!(try_get(&cx, &second).unwrap(), None);
    }

    #[test]
    fn test_edit_updates_and_removes() {
        let some = ContextKey::<String>::new("SomeMutableString");
        let another = ContextKey::<String>::new("AnotherMutableString");

        let root = fork(&Context::new());
        let child = fork(&root);

        set(&root, &some, "root".to_string()).unwrap();
        set(&root, &another, "anotherRoot".to_string()).unwrap();
        set(&child, &some, "child".to_string()).unwrap();

        assert_eq!(must_get(&child, &some).unwrap(), "child");
        assert_eq!(must_get(&child, &another).unwrap(), "anotherRoot");
        assert_eq!(must_get(&root, &some).unwrap(), "root");

        edit(&root, &some, |value| {
            assert_eq!(value.as_deref(), Some("root"));
            Some("root_2".to_string())
        })
        .unwrap();
        assert_eq!(must_get(&root, &some).unwrap(), "root_2");

        edit(&root, &some, |value| {
            assert!(value.is_some());
            None
        })
        .unwrap();

        edit(&root, &some, |value| {
            assert!(value.is_none());
            None
        })
        .unwrap();
        assert_eq!(try_get(&root, &some).unwrap(), None);
    }

    #[test]
    fn test_edit_ignores_ancestor_values() {
        let key = ContextKey::<i64>::new("counter");
        let root = fork(&Context::new());
        set(&root, &key, 41).unwrap();

        let child = fork(&root);
        edit(&child, &key, |value| {
            assert_eq!(value, None, "edit must only see the nearest node");
            Some(value.unwrap_or_default() + 1)
        })
        .unwrap();

        assert_eq!(must_get(&child, &key).unwrap(), 1);
        assert_eq!(must_get(&root, &key).unwrap(), 41);
    }

    #[test]
    fn test_concurrent_edits_are_serialized() {
        let key = Arc::new(ContextKey::<u64>::new("hits"));
        let cx = fork(&Context::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cx = cx.clone();
                let key = Arc::clone(&key);
                thread::spawn(move || {
                    for _ in 0..100 {
                        edit(&cx, &key, |v| Some(v.unwrap_or(0) + 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(must_get(&cx, &key).unwrap(), 800);
    }
}
