//! Live-query listener plumbing shared by every store backend.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Receives the full result set of a live query on every change.
pub type Listener<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

/// Holds a listener until the owning subscription closes.
///
/// Delivery and close both take the same lock, so once `close` returns the
/// listener has been dropped and cannot run again. A listener must not close
/// its own subscription from inside the callback.
pub struct ListenerSlot<T> {
    listener: Mutex<Option<Listener<T>>>,
}

impl<T> ListenerSlot<T> {
    pub fn new(listener: Listener<T>) -> Arc<Self> {
        Arc::new(Self {
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Returns false when the slot is already closed.
    pub fn deliver(&self, snapshot: Vec<T>) -> bool {
        let guard = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(listener) => {
                listener(snapshot);
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        let mut guard = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    pub fn is_open(&self) -> bool {
        match self.listener.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

/// Handle for one live query. Closing is idempotent and dropping closes.
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn close(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closed_slot_drops_deliveries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let slot = ListenerSlot::new(Box::new(move |batch: Vec<u32>| {
            seen.fetch_add(batch.len(), Ordering::SeqCst);
        }));

        assert!(slot.deliver(vec![1, 2]));
        slot.close();
        assert!(!slot.deliver(vec![3]));
        assert!(!slot.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn teardown_runs_once_and_on_drop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.close();
        subscription.close();
        assert!(subscription.is_closed());
        drop(subscription);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = runs.clone();
        let dropped = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(dropped);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
