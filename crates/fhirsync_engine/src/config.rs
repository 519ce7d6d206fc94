//! Configuration for the sync engine.

use fhirsync_model::{ConflictPolicy, MapOptions, ResourceType};
use std::time::Duration;

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of background sync, also the threshold for `is_sync_needed`.
    pub sync_interval: Duration,
    /// Start the background scheduler during `initialize`.
    pub enable_background_sync: bool,
    /// Initial conflict policy.
    pub conflict_resolution: ConflictPolicy,
    /// Data older than this forces a full refresh.
    pub max_data_age: Duration,
    /// Resource types to fetch.
    pub resource_types: Vec<ResourceType>,
    /// Report the count of newly applied records on completion.
    pub notify_on_new_data: bool,
    /// Page size requested from the fetcher.
    pub page_size: u32,
    /// Language passed to the mapper.
    pub preferred_language: String,
}

impl SyncConfig {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self {
            sync_interval: Duration::from_secs(60 * MINUTE),
            enable_background_sync: false,
            conflict_resolution: ConflictPolicy::ServerWins,
            max_data_age: Duration::from_secs(7 * DAY),
            resource_types: ResourceType::DEFAULTS.to_vec(),
            notify_on_new_data: true,
            page_size: 100,
            preferred_language: "en".into(),
        }
    }

    /// Sets the sync interval in minutes.
    pub fn with_sync_interval_minutes(mut self, minutes: u64) -> Self {
        self.sync_interval = Duration::from_secs(minutes * MINUTE);
        self
    }

    /// Sets the sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Enables or disables background sync.
    pub fn with_background_sync(mut self, enabled: bool) -> Self {
        self.enable_background_sync = enabled;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_resolution(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution = policy;
        self
    }

    /// Sets the maximum data age in days.
    pub fn with_max_data_age_days(mut self, days: u64) -> Self {
        self.max_data_age = Duration::from_secs(days * DAY);
        self
    }

    /// Sets the resource types to fetch.
    pub fn with_resource_types(mut self, resource_types: Vec<ResourceType>) -> Self {
        self.resource_types = resource_types;
        self
    }

    /// Enables or disables new-data notification.
    pub fn with_notify_on_new_data(mut self, notify: bool) -> Self {
        self.notify_on_new_data = notify;
        self
    }

    /// Sets the fetch page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the preferred language for display names.
    pub fn with_preferred_language(mut self, language: impl Into<String>) -> Self {
        self.preferred_language = language.into();
        self
    }

    /// Returns the mapping options derived from this configuration.
    pub fn map_options(&self) -> MapOptions {
        MapOptions::new(self.preferred_language.clone())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
