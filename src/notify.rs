//! Change-notification fan-out.
//!
//! A miniature pub/sub: upstream consumers register callbacks, the cache
//! broadcasts every invalidation it performs or observes. Broadcasts run
//! synchronously under the subscriber lock; callbacks are contractually
//! non-blocking.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::remote::EntryKind;

pub type ChangeCallback = Box<dyn Fn(&str, EntryKind) + Send + Sync>;

#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<ChangeCallback>>,
    /// Remotes whose source-side notification was already handled since
    /// the last janitor tick; a burst of events for one path expires it
    /// only once per interval.
    notified: Mutex<HashSet<String>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: ChangeCallback) {
        self.subscribers.lock().unwrap().push(callback);
    }

    pub fn broadcast(&self, path: &str, kind: EntryKind) {
        let subscribers = self.subscribers.lock().unwrap();
        for callback in subscribers.iter() {
            callback(path, kind);
        }
    }

    /// Record a source-side notification for `path`. Returns false when
    /// the path was already handled since the last [Notifier::clear_notified].
    pub fn mark_notified(&self, path: &str) -> bool {
        self.notified.lock().unwrap().insert(path.to_owned())
    }

    pub fn clear_notified(&self) {
        self.notified.lock().unwrap().clear();
    }
}
