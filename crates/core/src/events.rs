//! Per-event listener lists with disposable subscriptions
//!
//! Callbacks run on the transport task, in registration order. They must not
//! block; hand work off to a channel when it is heavier than a few field
//! updates. A callback may dispose its own (or any other) subscription.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::types::HeartbeatError;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Listener list for one event kind
pub struct Listeners<T> {
    table: Arc<Mutex<ListenerTable<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback; the returned token removes exactly this registration
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<ListenerTable<T>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                lock(&table).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Invoke every callback registered at the time of the call
    pub fn emit(&self, value: &T) {
        // Snapshot first so callbacks can subscribe or dispose without deadlocking
        let snapshot: Vec<Callback<T>> = lock(&self.table)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(table: &Mutex<ListenerTable<T>>) -> MutexGuard<'_, ListenerTable<T>> {
    // A panicking callback never runs under the lock, so the table stays consistent
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Disposable registration token
#[must_use = "keep the Subscription and call dispose() to remove the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(remove: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the listener; later calls do nothing
    pub fn dispose(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.remove.is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// All event kinds published by a transport
#[derive(Default)]
pub struct EventHub {
    pub status: Listeners<bool>,
    pub connect: Listeners<()>,
    pub reconnect: Listeners<()>,
    pub disconnect: Listeners<()>,
    pub message: Listeners<Value>,
    pub heartbeat: Listeners<()>,
    pub heartbeat_error: Listeners<HeartbeatError>,
}
