//! Listener registry with scoped subscriptions.
//!
//! [`Observers`] holds callbacks keyed by id. [`Observers::subscribe`] returns a
//! [`Subscription`] handle; dropping the handle (or calling
//! [`Subscription::unsubscribe`]) removes the listener. Notification snapshots
//! the listener list first, so a listener may drop its own subscription while
//! being called.
//!
//! A listener that returns an error or panics is logged and skipped; the
//! remaining listeners still run.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error};

type Listener<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

struct Registry<T> {
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Listener<T>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A set of listeners for events of type `T`.
pub struct Observers<T> {
    registry: Arc<Registry<T>>,
    name: &'static str,
}

impl<T: 'static> Observers<T> {
    /// `name` identifies the registry in log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
            name,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(id, Arc::new(listener));
        debug!(registry = self.name, listener = id, total = self.len(), "listener added");

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().remove(&id);
                }
            })),
        }
    }

    /// Call every listener in subscription order.
    pub fn notify(&self, event: &T) {
        if self.is_empty() {
            return;
        }
        let listeners: Vec<(u64, Listener<T>)> = self
            .registry
            .lock()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(registry = self.name, listener = id, "listener failed: {e:#}");
                }
                Err(_) => {
                    error!(registry = self.name, listener = id, "listener panicked");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`Observers::subscribe`]. The listener stays registered
/// for as long as the handle lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_reaches_all_listeners() {
        let observers = Observers::<u32>::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = observers.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
            Ok(())
        });
        let t2 = total.clone();
        let _b = observers.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
            Ok(())
        });

        observers.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let observers = Observers::<()>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = observers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(observers.len(), 1);

        observers.notify(&());
        drop(sub);
        observers.notify(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let observers = Observers::<()>::new("test");
        let sub = observers.subscribe(|_| Ok(()));
        sub.unsubscribe();
        assert!(observers.is_empty());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let observers = Observers::<()>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let _failing = observers.subscribe(|_| anyhow::bail!("boom"));
        let _panicking = observers.subscribe(|_| panic!("listener bug"));
        let h = hits.clone();
        let _ok = observers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        observers.notify(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outliving_registry_is_harmless() {
        let observers = Observers::<()>::new("test");
        let sub = observers.subscribe(|_| Ok(()));
        drop(observers);
        drop(sub);
    }
}
