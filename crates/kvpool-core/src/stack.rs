//! NamedStack: a thread-safe, capacity-less LIFO.
//!
//! Every kvpool pool is assembled from these: the warm and cold stacks of
//! the connection pool, and the idle stack of the worker dispatcher.
//! Ownership of an item moves atomically with `push`/`pop`, so an item is
//! never observable in two stacks at once.

use std::fmt;

use parking_lot::Mutex;

/// Concurrent last-in first-out stack.
///
/// The lock is held only for the duration of a single `push`, `pop` or
/// `take_all`; callers never iterate the stack while it is being mutated.
pub struct NamedStack<T> {
    items: Mutex<Vec<T>>,
}

impl<T> NamedStack<T> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Create an empty stack with room for `capacity` items before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Push an item on top of the stack.
    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Pop the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    /// Number of items currently on the stack.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Remove every item, returning them top-first.
    pub fn take_all(&self) -> Vec<T> {
        let mut items = std::mem::take(&mut *self.items.lock());
        items.reverse();
        items
    }
}

impl<T> Default for NamedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NamedStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedStack").field("len", &self.len()).finish()
    }
}

impl<T> FromIterator<T> for NamedStack<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: Mutex::new(iter.into_iter().collect()),
        }
    }
}
