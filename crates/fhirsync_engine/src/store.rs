//! Local data store and sync state store abstractions.
//!
//! Both stores are shared, externally synchronized resources. The engine
//! assumes each individual insert, update and save is atomic and does no
//! locking of its own.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fhirsync_model::{
    Allergy, Collection, Condition, DomainRecord, LabResult, Medication, RecordMeta, SyncState,
    Vaccination,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// CRUD access to the five normalized collections.
///
/// Records are keyed by external reference. Vaccinations are append-only
/// and have no update method.
#[async_trait]
pub trait LocalDataStore: Send + Sync {
    /// Returns all conditions.
    async fn conditions(&self) -> EngineResult<Vec<Condition>>;
    /// Inserts a condition.
    async fn save_condition(&self, record: &Condition) -> EngineResult<()>;
    /// Overwrites the condition with the same reference.
    async fn update_condition(&self, record: &Condition) -> EngineResult<()>;

    /// Returns all medications.
    async fn medications(&self) -> EngineResult<Vec<Medication>>;
    /// Inserts a medication.
    async fn save_medication(&self, record: &Medication) -> EngineResult<()>;
    /// Overwrites the medication with the same reference.
    async fn update_medication(&self, record: &Medication) -> EngineResult<()>;

    /// Returns all lab results.
    async fn lab_results(&self) -> EngineResult<Vec<LabResult>>;
    /// Inserts a lab result.
    async fn save_lab_result(&self, record: &LabResult) -> EngineResult<()>;
    /// Overwrites the lab result with the same reference.
    async fn update_lab_result(&self, record: &LabResult) -> EngineResult<()>;

    /// Returns all allergies.
    async fn allergies(&self) -> EngineResult<Vec<Allergy>>;
    /// Inserts an allergy.
    async fn save_allergy(&self, record: &Allergy) -> EngineResult<()>;
    /// Overwrites the allergy with the same reference.
    async fn update_allergy(&self, record: &Allergy) -> EngineResult<()>;

    /// Returns all vaccinations.
    async fn vaccinations(&self) -> EngineResult<Vec<Vaccination>>;
    /// Inserts a vaccination.
    async fn save_vaccination(&self, record: &Vaccination) -> EngineResult<()>;
}

/// Persists sync checkpoints, one per connection.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Loads the state of a connection.
    async fn get_sync_state(&self, connection_id: &str) -> EngineResult<Option<SyncState>>;

    /// Replaces the stored state of `state.connection_id`.
    async fn save_sync_state(&self, state: &SyncState) -> EngineResult<()>;
}

/// Loads every record of a collection.
pub async fn load_collection(
    store: &dyn LocalDataStore,
    collection: Collection,
) -> EngineResult<Vec<DomainRecord>> {
    Ok(match collection {
        Collection::Conditions => wrap(store.conditions().await?),
        Collection::Medications => wrap(store.medications().await?),
        Collection::LabResults => wrap(store.lab_results().await?),
        Collection::Allergies => wrap(store.allergies().await?),
        Collection::Vaccinations => wrap(store.vaccinations().await?),
    })
}

fn wrap<T: Into<DomainRecord>>(records: Vec<T>) -> Vec<DomainRecord> {
    records.into_iter().map(Into::into).collect()
}

/// Inserts a record through its collection's save method.
pub async fn insert_record(store: &dyn LocalDataStore, record: &DomainRecord) -> EngineResult<()> {
    match record {
        DomainRecord::Condition(r) => store.save_condition(r).await,
        DomainRecord::Medication(r) => store.save_medication(r).await,
        DomainRecord::LabResult(r) => store.save_lab_result(r).await,
        DomainRecord::Allergy(r) => store.save_allergy(r).await,
        DomainRecord::Vaccination(r) => store.save_vaccination(r).await,
    }
}

/// Overwrites a record through its collection's update method.
///
/// Fails for vaccinations, which are append-only.
pub async fn update_record(store: &dyn LocalDataStore, record: &DomainRecord) -> EngineResult<()> {
    match record {
        DomainRecord::Condition(r) => store.update_condition(r).await,
        DomainRecord::Medication(r) => store.update_medication(r).await,
        DomainRecord::LabResult(r) => store.update_lab_result(r).await,
        DomainRecord::Allergy(r) => store.update_allergy(r).await,
        DomainRecord::Vaccination(r) => Err(EngineError::Store(format!(
            "vaccination {} is append-only",
            r.external_reference
        ))),
    }
}

/// A write observed by [`MemoryLocalStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// A `save_*` call.
    Save(Collection, String),
    /// An `update_*` call.
    Update(Collection, String),
}

/// An in-memory local data store for testing.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<Collection, Vec<DomainRecord>>>,
    calls: Mutex<Vec<StoreCall>>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record without recording a call.
    pub fn seed(&self, record: impl Into<DomainRecord>) {
        let record = record.into();
        self.records
            .write()
            .entry(record.collection())
            .or_default()
            .push(record);
    }

    /// Returns the records of a collection in insertion order.
    pub fn records(&self, collection: Collection) -> Vec<DomainRecord> {
        self.records
            .read()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the record with a reference, if stored.
    pub fn find(&self, collection: Collection, external_reference: &str) -> Option<DomainRecord> {
        self.records
            .read()
            .get(&collection)?
            .iter()
            .find(|r| r.external_reference() == external_reference)
            .cloned()
    }

    /// Returns all writes observed so far.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// Forgets observed writes.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Makes every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn typed<T: Clone>(
        &self,
        collection: Collection,
        pick: impl Fn(&DomainRecord) -> Option<&T>,
    ) -> Vec<T> {
        self.records
            .read()
            .get(&collection)
            .map(|records| records.iter().filter_map(|r| pick(r).cloned()).collect())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(EngineError::Store("writes disabled".into()))
        } else {
            Ok(())
        }
    }

    fn save(&self, record: DomainRecord) -> EngineResult<()> {
        self.check_writable()?;
        let collection = record.collection();
        let reference = record.external_reference().to_string();
        let mut records = self.records.write();
        let bucket = records.entry(collection).or_default();
        if bucket.iter().any(|r| r.external_reference() == reference) {
            return Err(EngineError::Store(format!(
                "duplicate {collection} record {reference}"
            )));
        }
        bucket.push(record);
        self.calls.lock().push(StoreCall::Save(collection, reference));
        Ok(())
    }

    fn update(&self, record: DomainRecord) -> EngineResult<()> {
        self.check_writable()?;
        let collection = record.collection();
        let reference = record.external_reference().to_string();
        let mut records = self.records.write();
        let slot = records
            .get_mut(&collection)
            .and_then(|bucket| {
                bucket
                    .iter_mut()
                    .find(|r| r.external_reference() == reference)
            })
            .ok_or_else(|| EngineError::Store(format!("no {collection} record {reference}")))?;
        *slot = record;
        self.calls
            .lock()
            .push(StoreCall::Update(collection, reference));
        Ok(())
    }
}

#[async_trait]
impl LocalDataStore for MemoryLocalStore {
    async fn conditions(&self) -> EngineResult<Vec<Condition>> {
        Ok(self.typed(Collection::Conditions, |r| match r {
            DomainRecord::Condition(c) => Some(c),
            _ => None,
        }))
    }

    async fn save_condition(&self, record: &Condition) -> EngineResult<()> {
        self.save(record.clone().into())
    }

    async fn update_condition(&self, record: &Condition) -> EngineResult<()> {
        self.update(record.clone().into())
    }

    async fn medications(&self) -> EngineResult<Vec<Medication>> {
        Ok(self.typed(Collection::Medications, |r| match r {
            DomainRecord::Medication(m) => Some(m),
            _ => None,
        }))
    }

    async fn save_medication(&self, record: &Medication) -> EngineResult<()> {
        self.save(record.clone().into())
    }

    async fn update_medication(&self, record: &Medication) -> EngineResult<()> {
        self.update(record.clone().into())
    }

    async fn lab_results(&self) -> EngineResult<Vec<LabResult>> {
        Ok(self.typed(Collection::LabResults, |r| match r {
            DomainRecord::LabResult(l) => Some(l),
            _ => None,
        }))
    }

    async fn save_lab_result(&self, record: &LabResult) -> EngineResult<()> {
        self.save(record.clone().into())
    }

    async fn update_lab_result(&self, record: &LabResult) -> EngineResult<()> {
        self.update(record.clone().into())
    }

    async fn allergies(&self) -> EngineResult<Vec<Allergy>> {
        Ok(self.typed(Collection::Allergies, |r| match r {
            DomainRecord::Allergy(a) => Some(a),
            _ => None,
        }))
    }

    async fn save_allergy(&self, record: &Allergy) -> EngineResult<()> {
        self.save(record.clone().into())
    }

    async fn update_allergy(&self, record: &Allergy) -> EngineResult<()> {
        self.update(record.clone().into())
    }

    async fn vaccinations(&self) -> EngineResult<Vec<Vaccination>> {
        Ok(self.typed(Collection::Vaccinations, |r| match r {
            DomainRecord::Vaccination(v) => Some(v),
            _ => None,
        }))
    }

    async fn save_vaccination(&self, record: &Vaccination) -> EngineResult<()> {
        self.save(record.clone().into())
    }
}

/// An in-memory sync state store for testing.
#[derive(Default)]
pub struct MemorySyncStateStore {
    states: RwLock<HashMap<String, SyncState>>,
    saves: AtomicUsize,
}

impl MemorySyncStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a state directly.
    pub fn insert(&self, state: SyncState) {
        self.states.write().insert(state.connection_id.clone(), state);
    }

    /// Returns the stored state of a connection.
    pub fn get(&self, connection_id: &str) -> Option<SyncState> {
        self.states.read().get(connection_id).cloned()
    }

    /// Returns how many times a state was saved through the trait.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStateStore {
    async fn get_sync_state(&self, connection_id: &str) -> EngineResult<Option<SyncState>> {
        Ok(self.get(connection_id))
    }

    async fn save_sync_state(&self, state: &SyncState) -> EngineResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fhirsync_model::ConflictPolicy;

    fn vaccination(reference: &str) -> Vaccination {
        Vaccination {
            external_reference: reference.into(),
            last_updated: Utc.with_ymd_and_hms(2023, 10, 1, 0, 0, 0).unwrap(),
            vaccine: "Influenza".into(),
            code: None,
            occurred_on: Some("2023-10-01".into()),
            lot_number: None,
            status: Some("completed".into()),
        }
    }

    fn condition(reference: &str, name: &str) -> Condition {
        Condition {
            external_reference: reference.into(),
            last_updated: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            name: name.into(),
            code: None,
            clinical_status: None,
            onset: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn save_then_update_by_reference() {
        let store = MemoryLocalStore::new();
        store.save_condition(&condition("c1", "Asthma")).await.unwrap();
        store
            .update_condition(&condition("c1", "Severe asthma"))
            .await
            .unwrap();

        let conditions = store.conditions().await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].name, "Severe asthma");
        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Save(Collection::Conditions, "c1".into()),
                StoreCall::Update(Collection::Conditions, "c1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn rejects_duplicates_and_unknown_updates() {
        let store = MemoryLocalStore::new();
        store.save_condition(&condition("c1", "Asthma")).await.unwrap();
        assert!(store.save_condition(&condition("c1", "Asthma")).await.is_err());
        assert!(store
            .update_condition(&condition("c2", "Eczema"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vaccinations_cannot_be_updated() {
        let store = MemoryLocalStore::new();
        let record = DomainRecord::from(vaccination("imm-1"));
        insert_record(&store, &record).await.unwrap();
        assert!(update_record(&store, &record).await.is_err());

        let loaded = load_collection(&store, Collection::Vaccinations).await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn failing_writes() {
        let store = MemoryLocalStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save_vaccination(&vaccination("imm-1")).await,
            Err(EngineError::Store(_))
        ));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn sync_state_roundtrip() {
        let store = MemorySyncStateStore::new();
        assert!(store.get_sync_state("conn-1").await.unwrap().is_none());

        let state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
        store.save_sync_state(&state).await.unwrap();

        assert_eq!(store.get_sync_state("conn-1").await.unwrap(), Some(state));
        assert_eq!(store.save_count(), 1);
    }
}
