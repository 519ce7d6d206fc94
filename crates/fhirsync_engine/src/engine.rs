//! The sync engine.

use crate::auth::{AuthenticatedClient, Authenticator};
use crate::config::SyncConfig;
use crate::error::{EngineError, EngineResult};
use crate::fetcher::ResourceFetcher;
use crate::mapper::ResourceMapper;
use crate::reconcile::{
    apply_changes, collections_in_order, compare_collection, resolve_conflicts, upsert_record,
};
use crate::result::{SyncNeed, SyncNeedReason, SyncOptions, SyncResult};
use crate::scheduler::Scheduler;
use crate::status::{StatusTracker, Subscription, SyncProgress, SyncStatus, SyncStatusInfo};
use crate::store::{LocalDataStore, SyncStateStore};
use chrono::{DateTime, Utc};
use fhirsync_model::{
    Collection, ConflictPolicy, ConflictResolution, DomainRecord, FetchRequest, PendingChange,
    RecordMeta, ResourceType, SyncConflict, SyncState,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What is known about a pass when it aborts.
#[derive(Debug, Default)]
struct PassInfo {
    connection_id: Option<String>,
    full_refresh: bool,
}

/// Pulls clinical resources from a FHIR server into the local store.
///
/// One engine serves one connection at a time. Passes, conflict
/// resolution, local edit recording and cache invalidation are serialized
/// on an internal lock, so overlapping calls never interleave.
pub struct SyncEngine {
    config: SyncConfig,
    authenticator: Arc<dyn Authenticator>,
    fetcher: Arc<dyn ResourceFetcher>,
    mapper: Arc<dyn ResourceMapper>,
    store: Arc<dyn LocalDataStore>,
    state_store: Arc<dyn SyncStateStore>,
    policy: RwLock<ConflictPolicy>,
    state: RwLock<Option<SyncState>>,
    status: StatusTracker,
    pass: tokio::sync::Mutex<()>,
    scheduler: Scheduler,
}

impl SyncEngine {
    /// Creates a new sync engine.
    pub fn new(
        config: SyncConfig,
        authenticator: Arc<dyn Authenticator>,
        fetcher: Arc<dyn ResourceFetcher>,
        mapper: Arc<dyn ResourceMapper>,
        store: Arc<dyn LocalDataStore>,
        state_store: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            policy: RwLock::new(config.conflict_resolution),
            config,
            authenticator,
            fetcher,
            mapper,
            store,
            state_store,
            state: RwLock::new(None),
            status: StatusTracker::default(),
            pass: tokio::sync::Mutex::new(()),
            scheduler: Scheduler::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the conflict policy applied to the next pass.
    pub fn conflict_policy(&self) -> ConflictPolicy {
        *self.policy.read()
    }

    /// Sets the conflict policy applied to the next pass.
    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        *self.policy.write() = policy;
    }

    /// Returns the loaded sync state, if any.
    pub fn sync_state(&self) -> Option<SyncState> {
        self.state.read().clone()
    }

    /// Loads the state of the current connection.
    ///
    /// Creates a fresh state when none is stored. Starts the background
    /// scheduler when the configuration asks for it.
    pub async fn initialize(self: &Arc<Self>) -> EngineResult<()> {
        let client = self.require_client().await?;
        let state = self.load_state(client.connection_id()).await?;
        info!(
            connection = %state.connection_id,
            never_synced = state.never_synced(),
            "sync engine initialized"
        );
        if self.config.enable_background_sync {
            self.start_background_sync()?;
        }
        Ok(())
    }

    /// Runs one sync pass.
    ///
    /// Never fails: pass-level errors are reported through a result with
    /// `success == false` and a single error entry. A call made while
    /// another pass is running waits for it to finish.
    pub async fn sync(&self, options: SyncOptions) -> SyncResult {
        let _pass = self.pass.lock().await;
        self.run_pass(options).await
    }

    /// Starts the recurring background sync.
    ///
    /// Does nothing if it is already running.
    pub fn start_background_sync(self: &Arc<Self>) -> EngineResult<()> {
        if self
            .scheduler
            .start(Arc::downgrade(self), self.config.sync_interval)?
        {
            info!(
                interval_secs = self.config.sync_interval.as_secs(),
                "background sync started"
            );
        }
        Ok(())
    }

    /// Stops the recurring background sync.
    pub fn stop_background_sync(&self) {
        if self.scheduler.stop() {
            info!("background sync stopped");
        }
    }

    /// Returns true while the background scheduler is running.
    pub fn is_background_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Returns whether a pass is due. Has no side effects.
    pub fn is_sync_needed(&self) -> SyncNeed {
        let last_success = self
            .state
            .read()
            .as_ref()
            .and_then(|state| state.last_successful_sync_at);
        let reason = match last_success {
            None => SyncNeedReason::NeverSynced,
            Some(last) if elapsed_since(last, Utc::now()) >= self.config.sync_interval => {
                SyncNeedReason::IntervalElapsed
            }
            Some(_) => SyncNeedReason::RecentlySynced,
        };
        SyncNeed::from_reason(reason)
    }

    /// Returns the current status snapshot.
    pub fn status(&self) -> SyncStatusInfo {
        self.status.snapshot()
    }

    /// Registers a callback fired on every status transition.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatusInfo) + Send + Sync + 'static,
    {
        self.status.observers().subscribe(callback)
    }

    /// Forgets the last success and all watermarks, and persists that.
    ///
    /// The next pass will be a full refresh.
    pub async fn invalidate_cache(&self) -> EngineResult<()> {
        let _pass = self.pass.lock().await;
        let mut state = self.current_state().await?;
        state.invalidate();
        self.persist(state).await?;
        self.status.set_quietly(|info| {
            info.last_successful_sync_at = None;
            info.next_sync_at = None;
        });
        info!("sync cache invalidated");
        Ok(())
    }

    /// Returns the conflicts waiting for manual resolution.
    pub fn get_pending_conflicts(&self) -> Vec<SyncConflict> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.unresolved_conflicts.clone())
            .unwrap_or_default()
    }

    /// Settles a pending conflict.
    ///
    /// `Server` writes the server value, `Client` keeps the local record
    /// and `Merged` writes `merged`, which must be a record of the same
    /// collection and reference. Returns the resolved conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        merged: Option<DomainRecord>,
    ) -> EngineResult<SyncConflict> {
        let _pass = self.pass.lock().await;
        let mut state = self.current_state().await?;
        let mut conflict = state
            .take_conflict(conflict_id)
            .ok_or_else(|| EngineError::ConflictNotFound(conflict_id.to_string()))?;

        let write = match (resolution, merged) {
            (ConflictResolution::Server, None) => Some(conflict.server_value.clone()),
            (ConflictResolution::Client, None) => None,
            (ConflictResolution::Merged, Some(record)) => {
                if record.collection() != conflict.collection()
                    || record.external_reference() != conflict.resource_id
                {
                    return Err(EngineError::InvalidResolution(format!(
                        "merged record must be {} {}",
                        conflict.collection(),
                        conflict.resource_id
                    )));
                }
                Some(record)
            }
            (ConflictResolution::Merged, None) => {
                return Err(EngineError::InvalidResolution(
                    "merged resolution needs a merged record".into(),
                ))
            }
            (_, Some(_)) => {
                return Err(EngineError::InvalidResolution(
                    "merged data is only accepted with the merged resolution".into(),
                ))
            }
        };

        if let Some(record) = &write {
            upsert_record(self.store.as_ref(), record).await?;
            state.settle_local_edits(conflict.collection(), &conflict.resource_id);
        }
        conflict.resolve(resolution);
        self.persist(state).await?;

        info!(
            resource_type = %conflict.resource_type,
            resource_id = %conflict.resource_id,
            resolution = %resolution,
            "conflict resolved"
        );
        Ok(conflict)
    }

    /// Queues a local edit of a record.
    ///
    /// A later server update of the same record is then treated as a
    /// conflict instead of a plain update.
    pub async fn record_local_edit(
        &self,
        collection: Collection,
        external_reference: impl Into<String>,
    ) -> EngineResult<PendingChange> {
        let _pass = self.pass.lock().await;
        let mut state = self.current_state().await?;
        let change = PendingChange::local_edit(collection, external_reference, Utc::now());
        state.pending_changes.push(change.clone());
        self.persist(state).await?;
        debug!(collection = %collection, "local edit recorded");
        Ok(change)
    }

    /// Runs a scheduled pass unless one is already in flight.
    pub(crate) async fn background_tick(&self) {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("previous pass still running, skipping background tick");
            return;
        };
        let result = self.run_pass(SyncOptions::background()).await;
        if result.success {
            debug!(items = result.total_synced(), "background sync completed");
        } else {
            warn!(
                error = result.errors.first().map(|e| e.message.as_str()).unwrap_or("-"),
                "background sync failed"
            );
        }
    }

    async fn require_client(&self) -> EngineResult<AuthenticatedClient> {
        self.authenticator
            .authenticated_client()
            .await?
            .ok_or(EngineError::NotAuthenticated)
    }

    async fn load_state(&self, connection_id: &str) -> EngineResult<SyncState> {
        let cached = self
            .state
            .read()
            .clone()
            .filter(|state| state.connection_id == connection_id);
        if let Some(state) = cached {
            return Ok(state);
        }

        let state = match self.state_store.get_sync_state(connection_id).await? {
            Some(state) => state,
            None => SyncState::new(connection_id, self.conflict_policy()),
        };
        let interval = self.config.sync_interval;
        self.status.set_quietly(|info| {
            info.last_successful_sync_at = state.last_successful_sync_at;
            info.next_sync_at = state
                .last_successful_sync_at
                .map(|last| add_interval(last, interval));
        });
        *self.state.write() = Some(state.clone());
        Ok(state)
    }

    async fn current_state(&self) -> EngineResult<SyncState> {
        let cached = self.state.read().clone();
        match cached {
            Some(state) => Ok(state),
            None => {
                let client = self.require_client().await?;
                self.load_state(client.connection_id()).await
            }
        }
    }

    async fn persist(&self, state: SyncState) -> EngineResult<()> {
        self.state_store.save_sync_state(&state).await?;
        *self.state.write() = Some(state);
        Ok(())
    }

    fn wants_full_refresh(&self, state: &SyncState, requested: bool, now: DateTime<Utc>) -> bool {
        if requested {
            return true;
        }
        match state.last_successful_sync_at {
            None => true,
            Some(last) => elapsed_since(last, now) > self.config.max_data_age,
        }
    }

    async fn run_pass(&self, options: SyncOptions) -> SyncResult {
        let started = Instant::now();
        let attempt_at = Utc::now();
        self.status.update(|info| {
            info.status = SyncStatus::Checking;
            info.message = "Checking sync state".into();
            info.progress = None;
            info.background = options.background;
            info.last_attempt_at = Some(attempt_at);
            info.error = None;
            info.new_records = None;
        });

        let mut pass = PassInfo {
            connection_id: None,
            full_refresh: options.full_refresh,
        };
        match self.execute(options, &mut pass, started).await {
            Ok(result) => result,
            Err(err) => self.fail(&err, pass, started),
        }
    }

    async fn execute(
        &self,
        options: SyncOptions,
        pass: &mut PassInfo,
        started: Instant,
    ) -> EngineResult<SyncResult> {
        let client = self.require_client().await?;
        let connection_id = client.connection_id().to_string();
        pass.connection_id = Some(connection_id.clone());

        let mut state = self.load_state(&connection_id).await?;
        let now = Utc::now();
        let full_refresh = self.wants_full_refresh(&state, options.full_refresh, now);
        pass.full_refresh = full_refresh;

        let mut request =
            FetchRequest::full(self.config.resource_types.clone(), self.config.page_size);
        if !full_refresh {
            request = request.with_since(state.last_sync_at);
        }
        info!(
            connection = %connection_id,
            full_refresh,
            since = ?request.since,
            background = options.background,
            "sync pass started"
        );

        self.status
            .transition(SyncStatus::Fetching, "Fetching resources", None);
        let fetched = self.fetcher.fetch(&client, &request).await?;
        let items_synced: BTreeMap<ResourceType, usize> = request
            .resource_types
            .iter()
            .map(|resource_type| (*resource_type, fetched.count(*resource_type)))
            .collect();
        debug!(fetched = fetched.total(), "resources fetched");

        let map_options = self.config.map_options();
        let collections: Vec<_> = collections_in_order(&fetched)
            .filter(|(collection, _)| request.wants(collection.resource_type()))
            .collect();
        let total = collections.len();
        self.status.transition(
            SyncStatus::Comparing,
            "Comparing fetched resources",
            Some(SyncProgress {
                resource_type: None,
                processed: 0,
                total,
            }),
        );

        let mut changes = Vec::new();
        let mut conflicts = Vec::new();
        let mut errors = Vec::new();
        for (processed, (collection, raw)) in collections.into_iter().enumerate() {
            self.status.transition(
                SyncStatus::Comparing,
                format!("Comparing {collection}"),
                Some(SyncProgress {
                    resource_type: Some(collection.resource_type()),
                    processed,
                    total,
                }),
            );
            let comparison = compare_collection(
                self.store.as_ref(),
                self.mapper.as_ref(),
                &map_options,
                &state,
                collection,
                raw,
                now,
            )
            .await?;
            changes.extend(comparison.changes.into_iter().map(|change| change.record));
            conflicts.extend(comparison.conflicts);
            errors.extend(comparison.errors);
        }

        let policy = self.conflict_policy();
        self.status.transition(
            SyncStatus::Resolving,
            format!("Resolving {} conflicts", conflicts.len()),
            None,
        );
        changes.extend(resolve_conflicts(policy, &mut conflicts, &mut state));

        self.status.transition(
            SyncStatus::Applying,
            format!("Applying {} changes", changes.len()),
            Some(SyncProgress {
                resource_type: None,
                processed: 0,
                total: changes.len(),
            }),
        );
        let new_data = apply_changes(self.store.as_ref(), changes).await?;

        let finished = Utc::now();
        for (resource_type, count) in &items_synced {
            if *count > 0 {
                state.advance_watermark(*resource_type, finished);
            }
        }
        state.mark_success(finished);
        state.conflict_resolution = policy;
        self.persist(state.clone()).await?;

        let next_sync_at = add_interval(finished, self.config.sync_interval);
        let new_records = self.config.notify_on_new_data.then(|| new_data.len());
        let message = if errors.is_empty() {
            "Sync completed".to_string()
        } else {
            format!("Sync completed with {} errors", errors.len())
        };
        self.status.update(|info| {
            info.status = SyncStatus::Completed;
            info.message = message;
            info.progress = None;
            info.last_successful_sync_at = state.last_successful_sync_at;
            info.next_sync_at = Some(next_sync_at);
            info.error = None;
            info.new_records = new_records;
        });

        info!(
            connection = %connection_id,
            applied = new_data.len(),
            conflicts = conflicts.len(),
            errors = errors.len(),
            "sync pass completed"
        );

        Ok(SyncResult {
            success: true,
            connection_id: Some(connection_id),
            timestamp: finished,
            full_refresh,
            items_synced,
            conflicts,
            errors,
            new_data,
            next_sync_at,
            duration: started.elapsed(),
        })
    }

    fn fail(&self, err: &EngineError, pass: PassInfo, started: Instant) -> SyncResult {
        if err.is_authentication() {
            warn!(error = %err, "sync pass needs authentication");
        } else {
            error!(error = %err, "sync pass failed");
        }

        let now = Utc::now();
        let next_sync_at = add_interval(now, self.config.sync_interval);
        let message = format!("Sync failed: {err}");
        self.status.update(|info| {
            info.status = SyncStatus::Failed;
            info.message = message;
            info.progress = None;
            info.next_sync_at = Some(next_sync_at);
            info.error = Some(err.to_string());
            info.new_records = None;
        });

        SyncResult::failed(
            pass.connection_id,
            now,
            pass.full_refresh,
            err,
            next_sync_at,
            started.elapsed(),
        )
    }
}

/// Time from `since` to `now`, zero if `since` is in the future.
fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

fn add_interval(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(at)
}
