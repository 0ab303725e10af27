//! Hot-reloadable options snapshots
//!
//! [`OptionsMonitor`] hands out frozen `Arc` snapshots and fires change
//! listeners on update. Listeners are invalidation signals for the caches;
//! nothing mutates a snapshot in place.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

type ChangeListener<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

/// Current-value holder with change notification.
pub struct OptionsMonitor<T> {
    current: RwLock<Arc<T>>,
    listeners: Mutex<Vec<ChangeListener<T>>>,
}

impl<T> OptionsMonitor<T> {
    /// Create a monitor with an initial snapshot
    pub fn new(initial: T) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(initial)),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// The current frozen snapshot
    pub fn current(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Swap in a new snapshot and notify every listener.
    ///
    /// Listeners run synchronously on the updating thread and must not
    /// block; cache invalidation is the intended workload.
    pub fn update(&self, next: T) {
        let snapshot = Arc::new(next);
        *self.current.write() = snapshot.clone();
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener(&snapshot);
        }
    }

    /// Register a change listener
    pub fn on_change(&self, listener: impl Fn(&Arc<T>) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OptionsMonitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionsMonitor")
            .field("current", &self.current.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
