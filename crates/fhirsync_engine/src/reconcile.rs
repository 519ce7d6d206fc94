//! Diffing fetched resources against the local store.
//!
//! A pass reconciles collections in a fixed order: conditions,
//! medications, lab results, allergies, vaccinations. Each fetched
//! resource is mapped, matched by external reference and classified:
//!
//! | Local match | Incoming newer | Collection       | Outcome                    |
//! |-------------|----------------|------------------|----------------------------|
//! | none        | -              | any              | new record                 |
//! | found       | no             | any              | unchanged, skipped         |
//! | found       | yes            | vaccinations     | skipped (append-only)      |
//! | found       | yes            | lab results      | update (server authority)  |
//! | found       | yes            | others           | conflict check, else update|

use crate::error::EngineResult;
use crate::mapper::ResourceMapper;
use crate::result::{NewData, SyncError};
use crate::store::{insert_record, load_collection, update_record, LocalDataStore};
use chrono::{DateTime, Utc};
use fhirsync_model::{
    Collection, ConflictPolicy, ConflictResolution, DomainRecord, FetchedResources, MapOptions,
    RecordMeta, SyncConflict, SyncState,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Whether a change creates or overwrites a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// No local record had this reference at compare time.
    New,
    /// The incoming record is newer than the local one.
    Updated,
}

/// A record that should be written to the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Classification at compare time.
    pub kind: ChangeKind,
    /// Incoming record.
    pub record: DomainRecord,
}

/// Output of the compare phase for one collection.
#[derive(Debug, Default)]
pub struct Comparison {
    /// Records to write, in fetch order.
    pub changes: Vec<Change>,
    /// Records edited on both sides.
    pub conflicts: Vec<SyncConflict>,
    /// Per-resource mapping failures.
    pub errors: Vec<SyncError>,
}

/// Returns the conflict between a local and an incoming record, if any.
///
/// Both sides must carry unsynced changes: the record has a queued local
/// edit or a parked conflict, and the incoming copy is newer than the
/// stored one.
pub fn detect_conflict(
    state: &SyncState,
    local: &DomainRecord,
    incoming: &DomainRecord,
    now: DateTime<Utc>,
) -> Option<SyncConflict> {
    let collection = incoming.collection();
    let reference = incoming.external_reference();
    let locally_changed = state.local_edit_for(collection, reference).is_some()
        || state
            .parked_conflict(collection.resource_type(), reference)
            .is_some();
    let server_changed = incoming.last_updated() > local.last_updated();
    (locally_changed && server_changed)
        .then(|| SyncConflict::new(incoming.clone(), local.clone(), now))
}

/// Classifies the fetched resources of one collection.
///
/// Mapping failures are collected and never abort the comparison. A
/// reference seen twice in the same batch is compared against the copy
/// accepted earlier in the batch.
pub async fn compare_collection(
    store: &dyn LocalDataStore,
    mapper: &dyn ResourceMapper,
    options: &MapOptions,
    state: &SyncState,
    collection: Collection,
    raw: &[Value],
    now: DateTime<Utc>,
) -> EngineResult<Comparison> {
    let resource_type = collection.resource_type();
    let mut comparison = Comparison::default();
    if raw.is_empty() {
        return Ok(comparison);
    }

    let local: HashMap<String, DomainRecord> = load_collection(store, collection)
        .await?
        .into_iter()
        .map(|record| (record.external_reference().to_string(), record))
        .collect();

    let mut accepted: HashMap<String, DomainRecord> = HashMap::new();
    let mut change_index: HashMap<String, usize> = HashMap::new();

    for resource in raw {
        let incoming = match mapper.map(collection, resource, options) {
            Ok(record) => record,
            Err(err) => {
                let resource_id = resource
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                warn!(
                    resource_type = %resource_type,
                    resource_id = resource_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "skipping resource that failed to map"
                );
                comparison
                    .errors
                    .push(SyncError::mapping(resource_type, resource_id, &err));
                continue;
            }
        };

        let reference = incoming.external_reference().to_string();
        let local_record = local.get(&reference);
        let baseline = accepted.get(&reference).or(local_record);

        let kind = match baseline {
            None => ChangeKind::New,
            Some(existing) => {
                if !collection.supports_update() {
                    debug!(
                        collection = %collection,
                        reference = %reference,
                        "append-only record already stored"
                    );
                    continue;
                }
                if incoming.last_updated() <= existing.last_updated() {
                    continue;
                }
                if local_record.is_none() {
                    ChangeKind::New
                } else {
                    ChangeKind::Updated
                }
            }
        };

        if kind == ChangeKind::Updated && !collection.server_authoritative() {
            let parked = state.parked_conflict(resource_type, &reference);
            if parked.is_some_and(|c| incoming.last_updated() <= c.server_value.last_updated()) {
                debug!(
                    collection = %collection,
                    reference = %reference,
                    "record still awaiting conflict resolution"
                );
                continue;
            }
        }

        accepted.insert(reference.clone(), incoming.clone());

        if kind == ChangeKind::Updated && !collection.server_authoritative() {
            if let Some(local_record) = local_record {
                if let Some(conflict) = detect_conflict(state, local_record, &incoming, now) {
                    debug!(
                        collection = %collection,
                        reference = %reference,
                        field = %conflict.field,
                        "conflict detected"
                    );
                    if let Some(index) = change_index.remove(&reference) {
                        comparison.changes.remove(index);
                        reindex(&mut change_index, index);
                    }
                    comparison
                        .conflicts
                        .retain(|existing| existing.resource_id != reference);
                    comparison.conflicts.push(conflict);
                    continue;
                }
            }
        }

        let change = Change {
            kind,
            record: incoming,
        };
        match change_index.get(&reference) {
            Some(&index) => comparison.changes[index] = change,
            None => {
                change_index.insert(reference, comparison.changes.len());
                comparison.changes.push(change);
            }
        }
    }

    Ok(comparison)
}

fn reindex(index: &mut HashMap<String, usize>, removed: usize) {
    for position in index.values_mut() {
        if *position > removed {
            *position -= 1;
        }
    }
}

/// Settles conflicts according to a policy.
///
/// Returns the records that must be written as a consequence. Server-wins
/// settles the local edit and writes the server value. Client-wins keeps
/// the local edit queued and writes nothing. Manual parks the conflict in
/// `state` and writes nothing.
pub fn resolve_conflicts(
    policy: ConflictPolicy,
    conflicts: &mut [SyncConflict],
    state: &mut SyncState,
) -> Vec<DomainRecord> {
    let mut writes = Vec::new();
    for conflict in conflicts.iter_mut() {
        policy.resolve(conflict);
        match conflict.resolution {
            Some(ConflictResolution::Server) => {
                state.settle_local_edits(conflict.collection(), &conflict.resource_id);
                writes.push(conflict.server_value.clone());
            }
            Some(ConflictResolution::Client) | Some(ConflictResolution::Merged) => {}
            None => state.park_conflict(conflict.clone()),
        }
        debug!(
            resource_type = %conflict.resource_type,
            resource_id = %conflict.resource_id,
            policy = %policy,
            resolved = conflict.resolved,
            "conflict handled"
        );
    }
    writes
}

/// Result of writing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record was inserted.
    Inserted,
    /// An existing record was overwritten.
    Updated,
    /// The record exists and its collection is append-only.
    Skipped,
}

/// Writes records, routing each to update or insert.
///
/// Existence is re-read from the store when the apply phase starts, not
/// taken from the compare phase.
pub async fn apply_changes(
    store: &dyn LocalDataStore,
    records: Vec<DomainRecord>,
) -> EngineResult<NewData> {
    let mut existing: HashMap<Collection, HashSet<String>> = HashMap::new();
    let mut applied = NewData::default();

    for record in records {
        let collection = record.collection();
        if !existing.contains_key(&collection) {
            let references = load_collection(store, collection)
                .await?
                .iter()
                .map(|r| r.external_reference().to_string())
                .collect();
            existing.insert(collection, references);
        }
        let references = existing.entry(collection).or_default();
        let exists = references.contains(record.external_reference());
        let outcome = write_record(store, &record, exists).await?;
        if outcome != ApplyOutcome::Skipped {
            references.insert(record.external_reference().to_string());
            applied.push(record);
        }
    }

    Ok(applied)
}

/// Writes a single record, reading existence from the store.
pub async fn upsert_record(
    store: &dyn LocalDataStore,
    record: &DomainRecord,
) -> EngineResult<ApplyOutcome> {
    let exists = load_collection(store, record.collection())
        .await?
        .iter()
        .any(|r| r.external_reference() == record.external_reference());
    write_record(store, record, exists).await
}

async fn write_record(
    store: &dyn LocalDataStore,
    record: &DomainRecord,
    exists: bool,
) -> EngineResult<ApplyOutcome> {
    if !exists {
        insert_record(store, record).await?;
        return Ok(ApplyOutcome::Inserted);
    }
    if !record.collection().supports_update() {
        return Ok(ApplyOutcome::Skipped);
    }
    update_record(store, record).await?;
    Ok(ApplyOutcome::Updated)
}

/// Returns the raw resources of every collection in processing order.
pub fn collections_in_order(
    fetched: &FetchedResources,
) -> impl Iterator<Item = (Collection, &[Value])> {
    Collection::ALL
        .into_iter()
        .map(move |collection| (collection, fetched.for_collection(collection)))
}
