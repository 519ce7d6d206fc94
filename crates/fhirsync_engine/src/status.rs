//! Observable sync status.
//!
//! A pass moves through `checking → fetching → comparing → resolving →
//! applying → completed`, or to `failed` from any of those. Every
//! transition is broadcast to subscribers as a full [`SyncStatusInfo`]
//! snapshot.

use chrono::{DateTime, Utc};
use fhirsync_model::ResourceType;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// The current phase of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No pass has run yet.
    #[default]
    Idle,
    /// Loading state and deciding between full and incremental fetch.
    Checking,
    /// Retrieving resources from the server.
    Fetching,
    /// Diffing fetched resources against the local store.
    Comparing,
    /// Settling detected conflicts.
    Resolving,
    /// Writing changes to the local store.
    Applying,
    /// The last pass succeeded.
    Completed,
    /// The last pass failed.
    Failed,
}

impl SyncStatus {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncStatus::Checking
                | SyncStatus::Fetching
                | SyncStatus::Comparing
                | SyncStatus::Resolving
                | SyncStatus::Applying
        )
    }

    /// Returns true if a new pass may start.
    pub fn can_start_pass(&self) -> bool {
        !self.is_active()
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Checking => "checking",
            SyncStatus::Fetching => "fetching",
            SyncStatus::Comparing => "comparing",
            SyncStatus::Resolving => "resolving",
            SyncStatus::Applying => "applying",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress within the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Resource type being processed, if the phase works per type.
    pub resource_type: Option<ResourceType>,
    /// Units of work done.
    pub processed: usize,
    /// Units of work in the phase.
    pub total: usize,
}

/// Snapshot of the engine status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusInfo {
    /// Current phase.
    pub status: SyncStatus,
    /// Human-readable description.
    pub message: String,
    /// Progress metadata, when available.
    pub progress: Option<SyncProgress>,
    /// Whether the current or last pass was started by the scheduler.
    pub background: bool,
    /// Start of the current or last pass.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Most recent successful checkpoint.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// When the next pass is due.
    pub next_sync_at: Option<DateTime<Utc>>,
    /// Error of the last failed pass.
    pub error: Option<String>,
    /// Records applied by the last pass, when new-data notification is on.
    pub new_records: Option<usize>,
}

impl Default for SyncStatusInfo {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            message: "Idle".into(),
            progress: None,
            background: false,
            last_attempt_at: None,
            last_successful_sync_at: None,
            next_sync_at: None,
            error: None,
            new_records: None,
        }
    }
}

/// Callback invoked on every status transition.
pub type StatusCallback = Arc<dyn Fn(&SyncStatusInfo) + Send + Sync>;

#[derive(Default)]
struct ObserverList {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, StatusCallback)>>,
}

impl ObserverList {
    fn remove(&self, id: u64) {
        self.callbacks.lock().retain(|(existing, _)| *existing != id);
    }
}

/// Registration handle returned by `on_status_change`.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep
/// the callback registered for the lifetime of the engine.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: u64,
    list: Weak<ObserverList>,
}

impl Subscription {
    /// Removes the callback now.
    pub fn unsubscribe(self) {}

    /// Keeps the callback registered without holding the handle.
    pub fn detach(mut self) {
        self.list = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Ordered list of status callbacks.
#[derive(Default, Clone)]
pub struct StatusObservers {
    inner: Arc<ObserverList>,
}

impl StatusObservers {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. Callbacks fire in registration order.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatusInfo) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Calls every callback with a snapshot.
    ///
    /// Callbacks run without the list lock held, so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self, info: &SyncStatusInfo) {
        let callbacks: Vec<StatusCallback> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(info);
        }
    }

    /// Returns the number of registered callbacks.
    pub fn len(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Current status plus its observers.
#[derive(Default)]
pub(crate) struct StatusTracker {
    current: RwLock<SyncStatusInfo>,
    observers: StatusObservers,
}

impl StatusTracker {
    pub(crate) fn snapshot(&self) -> SyncStatusInfo {
        self.current.read().clone()
    }

    pub(crate) fn observers(&self) -> &StatusObservers {
        &self.observers
    }

    /// Updates the status and notifies observers.
    pub(crate) fn update(&self, change: impl FnOnce(&mut SyncStatusInfo)) {
        let snapshot = {
            let mut current = self.current.write();
            change(&mut current);
            current.clone()
        };
        self.observers.notify(&snapshot);
    }

    /// Moves to a new phase, replacing message and progress.
    pub(crate) fn transition(
        &self,
        status: SyncStatus,
        message: impl Into<String>,
        progress: Option<SyncProgress>,
    ) {
        let message = message.into();
        self.update(|info| {
            info.status = status;
            info.message = message;
            info.progress = progress;
        });
    }

    /// Updates timestamps without broadcasting.
    pub(crate) fn set_quietly(&self, change: impl FnOnce(&mut SyncStatusInfo)) {
        change(&mut self.current.write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        assert!(!SyncStatus::Idle.is_active());
        assert!(SyncStatus::Fetching.is_active());
        assert!(SyncStatus::Applying.is_active());
        assert!(SyncStatus::Completed.can_start_pass());
        assert!(SyncStatus::Failed.can_start_pass());
        assert!(!SyncStatus::Comparing.can_start_pass());
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let observers = StatusObservers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            observers.subscribe(move |_| seen.lock().push("first"))
        };
        let second = {
            let seen = Arc::clone(&seen);
            observers.subscribe(move |_| seen.lock().push("second"))
        };

        observers.notify(&SyncStatusInfo::default());
        assert_eq!(*seen.lock(), vec!["first", "second"]);

        first.unsubscribe();
        observers.notify(&SyncStatusInfo::default());
        assert_eq!(*seen.lock(), vec!["first", "second", "second"]);

        drop(second);
        assert!(observers.is_empty());
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let observers = StatusObservers::new();
        observers.subscribe(|_| {}).detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn callback_may_unsubscribe_others() {
        let observers = StatusObservers::new();
        let victim = Arc::new(Mutex::new(None));
        let handle = {
            let victim = Arc::clone(&victim);
            observers.subscribe(move |_| {
                victim.lock().take();
            })
        };
        *victim.lock() = Some(observers.subscribe(|_| {}));

        observers.notify(&SyncStatusInfo::default());
        assert_eq!(observers.len(), 1);
        drop(handle);
    }

    #[test]
    fn tracker_broadcasts_transitions() {
        let tracker = StatusTracker::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            tracker
                .observers()
                .subscribe(move |info| seen.lock().push(info.status))
        };

        tracker.transition(SyncStatus::Checking, "Checking", None);
        tracker.set_quietly(|info| info.background = true);
        tracker.transition(SyncStatus::Completed, "Done", None);

        assert_eq!(*seen.lock(), vec![SyncStatus::Checking, SyncStatus::Completed]);
        let snapshot = tracker.snapshot();
        assert!(snapshot.background);
        assert_eq!(snapshot.message, "Done");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SyncStatus::Resolving).unwrap();
        assert_eq!(json, "\"resolving\"");
    }
}
