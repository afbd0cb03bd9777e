//! Synchronous publish/subscribe registry.
//!
//! Every callback list in the system (transport message listeners, the
//! client-level message stream) is a [`Subscribers`] value: an explicit
//! registry with handle-based unsubscription and synchronous,
//! registration-order delivery.

use std::sync::{Arc, Mutex};

/// Handle returned by [`Subscribers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A cloneable handle to a shared subscriber list.
///
/// Clones publish to and mutate the same registry.
pub struct Subscribers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback. Callbacks fire in registration order.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let mut registry = self.registry.lock().expect("subscriber registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    /// Drop a subscription. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().expect("subscriber registry poisoned");
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _)| *entry_id != id.0);
        registry.entries.len() != before
    }

    /// Deliver `value` to every subscriber, synchronously, in registration
    /// order.
    ///
    /// The subscriber list is snapshotted before the first call, so
    /// callbacks may subscribe, unsubscribe or publish re-entrantly;
    /// mutations made during a publish take effect from the next one.
    pub fn publish(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let registry = self.registry.lock().expect("subscriber registry poisoned");
            registry
                .entries
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for callback in snapshot {
            callback(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let subscribers: Subscribers<&str> = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for marker in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            subscribers.subscribe(move |value: &&str| {
                seen.lock().unwrap().push(format!("{marker}:{value}"));
            });
        }

        subscribers.publish(&"hola");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:hola", "second:hola", "third:hola"]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let count = Arc::new(Mutex::new(0usize));

        let counter = Arc::clone(&count);
        let id = subscribers.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
        });

        subscribers.publish(&1);
        assert!(subscribers.unsubscribe(id));
        subscribers.publish(&2);

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!subscribers.unsubscribe(id), "second unsubscribe is a no-op");
    }

    #[test]
    fn reentrant_subscribe_during_publish_does_not_deadlock() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let late_calls = Arc::new(Mutex::new(0usize));

        let registry = subscribers.clone();
        let late = Arc::clone(&late_calls);
        subscribers.subscribe(move |_| {
            let late = Arc::clone(&late);
            registry.subscribe(move |_| {
                *late.lock().unwrap() += 1;
            });
        });

        subscribers.publish(&1);
        assert_eq!(*late_calls.lock().unwrap(), 0, "late subscriber fires next publish");

        subscribers.publish(&2);
        assert_eq!(*late_calls.lock().unwrap(), 1);
    }

    #[test]
    fn clones_share_one_registry() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let count = Arc::new(Mutex::new(0usize));

        let counter = Arc::clone(&count);
        subscribers.clone().subscribe(move |_| {
            *counter.lock().unwrap() += 1;
        });

        subscribers.publish(&7);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
