//! JSON-file backed stores.
//!
//! The data directory holds two files: `records.json` with the five
//! normalized collections and `sync_state.json` with one checkpoint per
//! connection. Every write replaces the whole file through a temporary
//! sibling and a rename, so a crash never leaves a half-written file.
//! Writes are serialized and the file I/O runs on the blocking pool.

use async_trait::async_trait;
use fhirsync_engine::{EngineError, EngineResult, LocalDataStore, SyncStateStore};
use fhirsync_model::{
    Allergy, Collection, Condition, LabResult, Medication, RecordMeta, SyncState, Vaccination,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as WriteLock;

const RECORDS_FILE: &str = "records.json";
const STATE_FILE: &str = "sync_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    medications: Vec<Medication>,
    #[serde(default)]
    lab_results: Vec<LabResult>,
    #[serde(default)]
    allergies: Vec<Allergy>,
    #[serde(default)]
    vaccinations: Vec<Vaccination>,
}

impl RecordFile {
    fn count(&self, collection: Collection) -> usize {
        match collection {
            Collection::Conditions => self.conditions.len(),
            Collection::Medications => self.medications.len(),
            Collection::LabResults => self.lab_results.len(),
            Collection::Allergies => self.allergies.len(),
            Collection::Vaccinations => self.vaccinations.len(),
        }
    }
}

/// Local data store and sync state store over a directory of JSON files.
pub struct JsonFileStore {
    dir: PathBuf,
    records: Mutex<RecordFile>,
    states: Mutex<BTreeMap<String, SyncState>>,
    writer: WriteLock<()>,
}

impl JsonFileStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let records = read_json(&dir.join(RECORDS_FILE))?.unwrap_or_default();
        let states = read_json(&dir.join(STATE_FILE))?.unwrap_or_default();
        Ok(Self {
            dir,
            records: Mutex::new(records),
            states: Mutex::new(states),
            writer: WriteLock::new(()),
        })
    }

    /// Returns the number of stored records in a collection.
    pub fn count(&self, collection: Collection) -> usize {
        self.records.lock().count(collection)
    }

    /// Applies an edit to a copy of the records and commits it once written.
    async fn write_records(
        &self,
        edit: impl FnOnce(&mut RecordFile) -> EngineResult<()> + Send,
    ) -> EngineResult<()> {
        let _writer = self.writer.lock().await;
        let mut next = self.records.lock().clone();
        edit(&mut next)?;
        write_json(self.dir.join(RECORDS_FILE), &next).await?;
        *self.records.lock() = next;
        Ok(())
    }
}

#[async_trait]
impl LocalDataStore for JsonFileStore {
    async fn conditions(&self) -> EngineResult<Vec<Condition>> {
        Ok(self.records.lock().conditions.clone())
    }

    async fn save_condition(&self, record: &Condition) -> EngineResult<()> {
        self.write_records(|file| insert(&mut file.conditions, record)).await
    }

    async fn update_condition(&self, record: &Condition) -> EngineResult<()> {
        self.write_records(|file| replace(&mut file.conditions, record)).await
    }

    async fn medications(&self) -> EngineResult<Vec<Medication>> {
        Ok(self.records.lock().medications.clone())
    }

    async fn save_medication(&self, record: &Medication) -> EngineResult<()> {
        self.write_records(|file| insert(&mut file.medications, record)).await
    }

    async fn update_medication(&self, record: &Medication) -> EngineResult<()> {
        self.write_records(|file| replace(&mut file.medications, record)).await
    }

    async fn lab_results(&self) -> EngineResult<Vec<LabResult>> {
        Ok(self.records.lock().lab_results.clone())
    }

    async fn save_lab_result(&self, record: &LabResult) -> EngineResult<()> {
        self.write_records(|file| insert(&mut file.lab_results, record)).await
    }

    async fn update_lab_result(&self, record: &LabResult) -> EngineResult<()> {
        self.write_records(|file| replace(&mut file.lab_results, record)).await
    }

    async fn allergies(&self) -> EngineResult<Vec<Allergy>> {
        Ok(self.records.lock().allergies.clone())
    }

    async fn save_allergy(&self, record: &Allergy) -> EngineResult<()> {
        self.write_records(|file| insert(&mut file.allergies, record)).await
    }

    async fn update_allergy(&self, record: &Allergy) -> EngineResult<()> {
        self.write_records(|file| replace(&mut file.allergies, record)).await
    }

    async fn vaccinations(&self) -> EngineResult<Vec<Vaccination>> {
        Ok(self.records.lock().vaccinations.clone())
    }

    async fn save_vaccination(&self, record: &Vaccination) -> EngineResult<()> {
        self.write_records(|file| insert(&mut file.vaccinations, record)).await
    }
}

#[async_trait]
impl SyncStateStore for JsonFileStore {
    async fn get_sync_state(&self, connection_id: &str) -> EngineResult<Option<SyncState>> {
        Ok(self.states.lock().get(connection_id).cloned())
    }

    async fn save_sync_state(&self, state: &SyncState) -> EngineResult<()> {
        let _writer = self.writer.lock().await;
        let mut next = self.states.lock().clone();
        next.insert(state.connection_id.clone(), state.clone());
        write_json(self.dir.join(STATE_FILE), &next)
            .await
            .map_err(|e| EngineError::StateStore(e.to_string()))?;
        *self.states.lock() = next;
        Ok(())
    }
}

fn insert<T: RecordMeta + Clone>(records: &mut Vec<T>, record: &T) -> EngineResult<()> {
    let reference = record.external_reference();
    if records.iter().any(|r| r.external_reference() == reference) {
        return Err(EngineError::Store(format!("record {reference} already exists")));
    }
    records.push(record.clone());
    Ok(())
}

fn replace<T: RecordMeta + Clone>(records: &mut [T], record: &T) -> EngineResult<()> {
    let reference = record.external_reference();
    let slot = records
        .iter_mut()
        .find(|r| r.external_reference() == reference)
        .ok_or_else(|| EngineError::Store(format!("record {reference} not found")))?;
    *slot = record.clone();
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))
    })
    .await
    .map_err(|e| EngineError::Store(format!("write task failed: {e}")))?
}

fn io_error(path: &Path, err: io::Error) -> EngineError {
    EngineError::Store(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_model::ConflictPolicy;
    use fhirsync_testkit::{condition, ts, vaccination};
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store
                .save_condition(&condition("cond-1", "2024-01-01", "Asthma"))
                .await
                .unwrap();
            store
                .update_condition(&condition("cond-1", "2024-02-01", "Severe asthma"))
                .await
                .unwrap();
            store
                .save_vaccination(&vaccination("imm-1", "2024-01-01", "Influenza"))
                .await
                .unwrap();
        }

        let store = JsonFileStore::open(dir.path()).unwrap();
        let conditions = store.conditions().await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].name, "Severe asthma");
        assert_eq!(store.count(Collection::Vaccinations), 1);
        assert!(!dir.path().join("records.json.tmp").exists());
    }

    #[tokio::test]
    async fn rejected_writes_leave_file_untouched() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let record = condition("cond-1", "2024-01-01", "Asthma");
        store.save_condition(&record).await.unwrap();

        assert!(store.save_condition(&record).await.is_err());
        assert!(store
            .update_condition(&condition("cond-9", "2024-01-01", "X"))
            .await
            .is_err());

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count(Collection::Conditions), 1);
    }

    #[tokio::test]
    async fn sync_state_per_connection() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let mut state = SyncState::new("conn-a", ConflictPolicy::Manual);
        state.mark_success(ts("2024-03-01"));
        store.save_sync_state(&state).await.unwrap();
        store
            .save_sync_state(&SyncState::new("conn-b", ConflictPolicy::ServerWins))
            .await
            .unwrap();

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_sync_state("conn-a").await.unwrap(), Some(state));
        assert!(reopened.get_sync_state("conn-b").await.unwrap().is_some());
        assert!(reopened.get_sync_state("conn-c").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_all_land() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::open(dir.path()).unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let record = condition(&format!("cond-{i}"), "2024-01-01", "Asthma");
                    store.save_condition(&record).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.count(Collection::Conditions), 8);
        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count(Collection::Conditions), 8);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(RECORDS_FILE), b"{ not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(dir.path()),
            Err(EngineError::Serialization(_))
        ));
    }
}
