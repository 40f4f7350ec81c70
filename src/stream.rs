use crate::model::song::PitchSample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Box<dyn FnMut(&T) + Send>;

struct Slot<T> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Arc<Mutex<Handler<T>>>,
}

struct Registry<T> {
    next_id: u64,
    slots: Vec<Slot<T>>,
}

/// Fan-out point for a push stream. Handlers run synchronously, in
/// subscription order, on whichever thread calls `publish`.
///
/// Cloning yields another handle onto the same subscriber list.
pub struct Publisher<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Publisher<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: impl FnMut(&T) + Send + 'static) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut registry = self.registry.lock().unwrap();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.slots.push(Slot {
                id,
                active: Arc::clone(&active),
                handler: Arc::new(Mutex::new(Box::new(handler))),
            });
            id
        };

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            active.store(false, Ordering::Release);
            if let Some(registry) = registry.upgrade() {
                registry.lock().unwrap().slots.retain(|s| s.id != id);
            }
        })
    }

    /// Delivers a value to every live subscriber. The registry lock is
    /// not held while handlers run, so a handler may cancel its own
    /// subscription (or subscribe anew) without deadlocking.
    pub fn publish(&self, value: &T) {
        let snapshot: Vec<(Arc<AtomicBool>, Arc<Mutex<Handler<T>>>)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .slots
                .iter()
                .map(|s| (Arc::clone(&s.active), Arc::clone(&s.handler)))
                .collect()
        };

        for (active, handler) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            (handler.lock().unwrap())(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().unwrap().slots.len()
    }
}

/// Handle for one subscription. `cancel` is synchronous: once it
/// returns, the handler will not be invoked again. Dropping the handle
/// cancels as well.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Upstream producer of microphone pitch frames.
pub trait PitchSource {
    fn subscribe_samples(&self, handler: Box<dyn FnMut(&PitchSample) + Send>) -> Subscription;
}

impl PitchSource for Publisher<PitchSample> {
    fn subscribe_samples(&self, handler: Box<dyn FnMut(&PitchSample) + Send>) -> Subscription {
        self.subscribe(handler)
    }
}
