//! A sync engine wired to in-memory collaborators.

use fhirsync_engine::{
    AccessToken, AuthenticatedClient, Connection, MemoryLocalStore, MemorySyncStateStore,
    MockFetcher, ResourceMapper, StaticAuthenticator, Subscription, SyncConfig, SyncEngine,
    SyncStatus, SyncStatusInfo,
};
use fhirsync_model::{
    Allergy, Condition, LabResult, MapOptions, MappingError, Medication, R4Mapper, SyncState,
    Vaccination,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Connection ID used by the harness.
pub const CONNECTION_ID: &str = "conn-test";

/// Returns the client the harness authenticates with.
pub fn test_client() -> AuthenticatedClient {
    AuthenticatedClient::new(
        Connection::new(CONNECTION_ID, "https://fhir.example.test/r4").with_patient("pat-1"),
        AccessToken::new("test-token"),
    )
}

/// A test harness for engine integration tests.
pub struct TestHarness {
    /// The engine under test.
    pub engine: Arc<SyncEngine>,
    /// Authenticator; revoke it to simulate logout.
    pub auth: Arc<StaticAuthenticator>,
    /// Scripted fetcher.
    pub fetcher: Arc<MockFetcher>,
    /// Local data store.
    pub store: Arc<MemoryLocalStore>,
    /// Sync state store.
    pub state_store: Arc<MemorySyncStateStore>,
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Creates a harness with the reference mapper.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_mapper(config, Arc::new(R4Mapper))
    }

    /// Creates a harness with a custom mapper.
    pub fn with_mapper(config: SyncConfig, mapper: Arc<dyn ResourceMapper>) -> Self {
        let auth = Arc::new(StaticAuthenticator::new(test_client()));
        let fetcher = Arc::new(MockFetcher::new());
        let store = Arc::new(MemoryLocalStore::new());
        let state_store = Arc::new(MemorySyncStateStore::new());
        let engine = Arc::new(SyncEngine::new(
            config,
            auth.clone(),
            fetcher.clone(),
            mapper,
            store.clone(),
            state_store.clone(),
        ));
        Self {
            engine,
            auth,
            fetcher,
            store,
            state_store,
        }
    }

    /// Edits the stored state of the harness connection.
    ///
    /// Must be called before the engine loads its state.
    pub fn seed_state(&self, edit: impl FnOnce(&mut SyncState)) {
        let mut state = self
            .state_store
            .get(CONNECTION_ID)
            .unwrap_or_else(|| SyncState::new(CONNECTION_ID, self.engine.conflict_policy()));
        edit(&mut state);
        self.state_store.insert(state);
    }

    /// Returns the persisted state of the harness connection.
    pub fn stored_state(&self) -> SyncState {
        self.state_store
            .get(CONNECTION_ID)
            .expect("No sync state stored")
    }

    /// Starts recording status transitions.
    pub fn record_statuses(&self) -> StatusRecorder {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = Arc::clone(&seen);
            self.engine
                .on_status_change(move |info| seen.lock().push(info.clone()))
        };
        StatusRecorder {
            seen,
            _subscription: subscription,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects status snapshots while alive.
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<SyncStatusInfo>>>,
    _subscription: Subscription,
}

impl StatusRecorder {
    /// Returns every snapshot received.
    pub fn snapshots(&self) -> Vec<SyncStatusInfo> {
        self.seen.lock().clone()
    }

    /// Returns the statuses received, collapsing consecutive repeats.
    pub fn statuses(&self) -> Vec<SyncStatus> {
        let mut statuses: Vec<SyncStatus> = self.seen.lock().iter().map(|i| i.status).collect();
        statuses.dedup();
        statuses
    }

    /// Forgets everything received so far.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// Reference mapper that fails on chosen resource IDs.
pub struct FailingMapper {
    failing: HashSet<String>,
}

impl FailingMapper {
    /// Creates a mapper that rejects the given IDs.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: ids.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, raw: &Value) -> Result<(), MappingError> {
        match raw.get("id").and_then(Value::as_str) {
            Some(id) if self.failing.contains(id) => Err(MappingError::MissingField("code")),
            _ => Ok(()),
        }
    }
}

impl ResourceMapper for FailingMapper {
    fn map_condition(&self, raw: &Value, options: &MapOptions) -> Result<Condition, MappingError> {
        self.check(raw)?;
        R4Mapper.map_condition(raw, options)
    }

    fn map_medication(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Medication, MappingError> {
        self.check(raw)?;
        R4Mapper.map_medication(raw, options)
    }

    fn map_lab_result(&self, raw: &Value, options: &MapOptions) -> Result<LabResult, MappingError> {
        self.check(raw)?;
        R4Mapper.map_lab_result(raw, options)
    }

    fn map_allergy(&self, raw: &Value, options: &MapOptions) -> Result<Allergy, MappingError> {
        self.check(raw)?;
        R4Mapper.map_allergy(raw, options)
    }

    fn map_vaccination(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Vaccination, MappingError> {
        self.check(raw)?;
        R4Mapper.map_vaccination(raw, options)
    }
}
