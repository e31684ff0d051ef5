//! Typed listener registry with explicit unsubscribe handles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Identifier returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<T>)>,
}

/// A set of callbacks invoked synchronously with each emitted value.
///
/// Callbacks run on the emitting task after the registry lock is released, so
/// a callback may add or remove listeners without deadlocking.
pub struct ListenerRegistry<T: ?Sized> {
    inner: Arc<Mutex<Listeners<T>>>,
}

impl<T: ?Sized> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: ?Sized> ListenerRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = lock(&self.inner);
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Register a listener and return a handle that unregisters it
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let id = self.add(listener);
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        remove_from(&self.inner, id)
    }

    /// Invoke every current listener with `value`
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.inner)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription<T: ?Sized> {
    id: ListenerId,
    registry: Weak<Mutex<Listeners<T>>>,
}

impl<T: ?Sized> Subscription<T> {
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns `false` if the registry is gone or the
    /// listener was already removed.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| remove_from(&inner, self.id))
    }
}

impl<T: ?Sized> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn remove_from<T: ?Sized>(inner: &Mutex<Listeners<T>>, id: ListenerId) -> bool {
    let mut listeners = lock(inner);
    let before = listeners.entries.len();
    listeners.entries.retain(|(entry_id, _)| *entry_id != id);
    listeners.entries.len() != before
}

fn lock<T: ?Sized>(inner: &Mutex<Listeners<T>>) -> MutexGuard<'_, Listeners<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
