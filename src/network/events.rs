//! Observer Fan-out
//!
//! Publish-subscribe for status transitions and inbound notifications.
//! Every subscription is a handle; dropping it removes the observer, so
//! repeated reconnects never accumulate stale callbacks.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    observers: BTreeMap<u64, Observer<T>>,
}

/// Fans values out to registered observers.
pub struct Broadcaster<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    /// Create a broadcaster with no observers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                observers: BTreeMap::new(),
            })),
        }
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.registry.lock().map(|r| r.observers.len()).unwrap_or(0)
    }
}

impl<T: 'static> Broadcaster<T> {
    /// Register an observer. It stays registered while the handle lives.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.registry.lock() {
            Ok(mut registry) => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.observers.insert(id, Arc::new(observer));
                id
            }
            Err(_) => {
                error!("Observer registry poisoned; subscription ignored");
                return Subscription { cancel: None };
            }
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    if let Ok(mut registry) = registry.lock() {
                        registry.observers.remove(&id);
                    }
                }
            })),
        }
    }

    /// Deliver a value to every observer, in subscription order.
    ///
    /// Observers run outside the registry lock, so they may subscribe or
    /// unsubscribe from inside the callback. A panicking observer is logged
    /// and skipped.
    pub fn publish(&self, value: &T) {
        let observers: Vec<Observer<T>> = match self.registry.lock() {
            Ok(registry) => registry.observers.values().cloned().collect(),
            Err(_) => return,
        };

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(value))).is_err() {
                error!("Observer panicked; continuing with remaining observers");
            }
        }
    }
}

/// Handle to a registered observer.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the observer now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the observer registered for the broadcaster's whole lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_all_observers() {
        let broadcaster = Broadcaster::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = broadcaster.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = broadcaster.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        broadcaster.publish(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broadcaster = Broadcaster::<u32>::new();
        let sub = broadcaster.subscribe(|_| {});
        assert_eq!(broadcaster.observer_count(), 1);

        drop(sub);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_unsubscribe_and_detach() {
        let broadcaster = Broadcaster::<u32>::new();

        broadcaster.subscribe(|_| {}).unsubscribe();
        assert_eq!(broadcaster.observer_count(), 0);

        broadcaster.subscribe(|_| {}).detach();
        assert_eq!(broadcaster.observer_count(), 1);
    }

    #[test]
    fn test_panicking_observer_isolated() {
        let broadcaster = Broadcaster::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let _bad = broadcaster.subscribe(|_| panic!("observer bug"));
        let s = seen.clone();
        let _good = broadcaster.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(&1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outlives_broadcaster() {
        let broadcaster = Broadcaster::<u32>::new();
        let sub = broadcaster.subscribe(|_| {});
        drop(broadcaster);
        drop(sub);
    }
}
