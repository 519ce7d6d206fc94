//! Synchronization checkpoints.

use crate::conflict::{ConflictPolicy, SyncConflict};
use crate::resource::{Collection, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A queued local mutation that has not been reconciled with the server.
///
/// Nothing pushes these to the server yet. They exist so the engine can
/// tell a record edited on both sides apart from a plain server update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingChange {
    /// A record was edited locally.
    LocalEdit {
        /// Change ID.
        id: Uuid,
        /// Collection of the edited record.
        collection: Collection,
        /// External reference of the edited record.
        external_reference: String,
        /// When the edit happened.
        edited_at: DateTime<Utc>,
    },
}

impl PendingChange {
    /// Creates a local edit entry.
    pub fn local_edit(
        collection: Collection,
        external_reference: impl Into<String>,
        edited_at: DateTime<Utc>,
    ) -> Self {
        PendingChange::LocalEdit {
            id: Uuid::new_v4(),
            collection,
            external_reference: external_reference.into(),
            edited_at,
        }
    }

    /// Returns true if this change touches the given record.
    pub fn touches(&self, collection: Collection, external_reference: &str) -> bool {
        match self {
            PendingChange::LocalEdit {
                collection: c,
                external_reference: r,
                ..
            } => *c == collection && r == external_reference,
        }
    }

    /// Returns when the change was made.
    pub fn changed_at(&self) -> DateTime<Utc> {
        match self {
            PendingChange::LocalEdit { edited_at, .. } => *edited_at,
        }
    }
}

/// Synchronization checkpoint for one connection.
///
/// # Invariants
///
/// - `last_successful_sync_at <= last_sync_at` whenever both are set
/// - A watermark in `resource_timestamps` never moves backwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Connection this state belongs to.
    pub connection_id: String,
    /// Time of the most recent checkpoint.
    pub last_sync_at: DateTime<Utc>,
    /// Time of the most recent successful pass.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// Per-type watermarks.
    pub resource_timestamps: BTreeMap<ResourceType, DateTime<Utc>>,
    /// Local mutations not yet reconciled.
    pub pending_changes: Vec<PendingChange>,
    /// Conflicts awaiting manual resolution.
    #[serde(default)]
    pub unresolved_conflicts: Vec<SyncConflict>,
    /// Policy in force at the last checkpoint.
    pub conflict_resolution: ConflictPolicy,
}

impl SyncState {
    /// Creates a zero-value state for a connection that never synced.
    pub fn new(connection_id: impl Into<String>, conflict_resolution: ConflictPolicy) -> Self {
        Self {
            connection_id: connection_id.into(),
            last_sync_at: DateTime::<Utc>::default(),
            last_successful_sync_at: None,
            resource_timestamps: BTreeMap::new(),
            pending_changes: Vec::new(),
            unresolved_conflicts: Vec::new(),
            conflict_resolution,
        }
    }

    /// Returns true if no pass has ever succeeded.
    pub fn never_synced(&self) -> bool {
        self.last_successful_sync_at.is_none()
    }

    /// Returns the watermark of a resource type.
    pub fn watermark(&self, resource_type: ResourceType) -> Option<DateTime<Utc>> {
        self.resource_timestamps.get(&resource_type).copied()
    }

    /// Advances a watermark, never moving it backwards.
    pub fn advance_watermark(&mut self, resource_type: ResourceType, at: DateTime<Utc>) {
        self.resource_timestamps
            .entry(resource_type)
            .and_modify(|current| *current = (*current).max(at))
            .or_insert(at);
    }

    /// Records a successful pass finishing at `at`.
    pub fn mark_success(&mut self, at: DateTime<Utc>) {
        let at = at.max(self.last_sync_at);
        self.last_sync_at = at;
        self.last_successful_sync_at = Some(at);
    }

    /// Forgets the last success and all watermarks.
    ///
    /// The next pass will be a full refresh.
    pub fn invalidate(&mut self) {
        self.last_successful_sync_at = None;
        self.resource_timestamps.clear();
    }

    /// Returns the unsynced local edit for a record, if any.
    ///
    /// An edit stays queued across passes until a resolution settles it.
    pub fn local_edit_for(
        &self,
        collection: Collection,
        external_reference: &str,
    ) -> Option<&PendingChange> {
        self.pending_changes
            .iter()
            .find(|change| change.touches(collection, external_reference))
    }

    /// Returns the parked conflict for a record, if any.
    pub fn parked_conflict(
        &self,
        resource_type: ResourceType,
        external_reference: &str,
    ) -> Option<&SyncConflict> {
        self.unresolved_conflicts.iter().find(|conflict| {
            conflict.resource_type == resource_type && conflict.resource_id == external_reference
        })
    }

    /// Drops queued local edits for a record.
    pub fn settle_local_edits(&mut self, collection: Collection, external_reference: &str) {
        self.pending_changes
            .retain(|change| !change.touches(collection, external_reference));
    }

    /// Stores an unresolved conflict, replacing an older one for the same record.
    pub fn park_conflict(&mut self, conflict: SyncConflict) {
        self.unresolved_conflicts.retain(|existing| {
            !(existing.resource_type == conflict.resource_type
                && existing.resource_id == conflict.resource_id)
        });
        self.unresolved_conflicts.push(conflict);
    }

    /// Removes and returns an unresolved conflict by ID.
    pub fn take_conflict(&mut self, id: Uuid) -> Option<SyncConflict> {
        let index = self.unresolved_conflicts.iter().position(|c| c.id == id)?;
        Some(self.unresolved_conflicts.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn fresh_state_is_zero_value() {
        let state = SyncState::new("conn-1", ConflictPolicy::Manual);
        assert_eq!(state.last_sync_at, DateTime::<Utc>::default());
        assert!(state.never_synced());
        assert!(state.resource_timestamps.is_empty());
        assert!(state.pending_changes.is_empty());
        assert_eq!(state.conflict_resolution, ConflictPolicy::Manual);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
        state.advance_watermark(ResourceType::Condition, at(10));
        state.advance_watermark(ResourceType::Condition, at(5));
        assert_eq!(state.watermark(ResourceType::Condition), Some(at(10)));

        state.advance_watermark(ResourceType::Condition, at(11));
        assert_eq!(state.watermark(ResourceType::Condition), Some(at(11)));
    }

    #[test]
    fn success_keeps_ordering_invariant() {
        let mut state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
        state.mark_success(at(3));
        assert_eq!(state.last_successful_sync_at, Some(at(3)));
        assert!(state.last_successful_sync_at.unwrap() <= state.last_sync_at);
    }

    #[test]
    fn invalidate_clears_success_and_watermarks() {
        let mut state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
        state.mark_success(at(3));
        state.advance_watermark(ResourceType::Observation, at(3));

        state.invalidate();

        assert!(state.never_synced());
        assert!(state.resource_timestamps.is_empty());
        assert_eq!(state.last_sync_at, at(3));
    }

    #[test]
    fn local_edits_count_until_settled() {
        let mut state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
        state
            .pending_changes
            .push(PendingChange::local_edit(Collection::Conditions, "cond-1", at(2)));
        assert!(state.local_edit_for(Collection::Conditions, "cond-1").is_some());

        state.mark_success(at(3));
        assert!(state.local_edit_for(Collection::Conditions, "cond-1").is_some());
        assert!(state.local_edit_for(Collection::Allergies, "cond-1").is_none());

        state.settle_local_edits(Collection::Conditions, "cond-1");
        assert!(state.pending_changes.is_empty());
        assert!(state.local_edit_for(Collection::Conditions, "cond-1").is_none());
    }

    #[test]
    fn parked_conflict_lookup() {
        use crate::record::{Condition, DomainRecord};

        let condition = |day: u32, name: &str| {
            DomainRecord::Condition(Condition {
                external_reference: "cond-1".into(),
                last_updated: at(day),
                name: name.into(),
                code: None,
                clinical_status: None,
                onset: None,
                notes: None,
            })
        };
        let mut state = SyncState::new("conn-1", ConflictPolicy::Manual);
        let conflict =
            SyncConflict::new(condition(5, "Severe asthma"), condition(1, "Asthma"), at(6));
        state.park_conflict(conflict.clone());

        assert_eq!(
            state.parked_conflict(ResourceType::Condition, "cond-1"),
            Some(&conflict)
        );
        assert!(state.parked_conflict(ResourceType::Condition, "cond-2").is_none());
        assert!(state
            .parked_conflict(ResourceType::AllergyIntolerance, "cond-1")
            .is_none());
    }

    #[test]
    fn state_survives_json() {
        let mut state = SyncState::new("conn-1", ConflictPolicy::ClientWins);
        state.mark_success(at(3));
        state.advance_watermark(ResourceType::Immunization, at(3));
        state
            .pending_changes
            .push(PendingChange::local_edit(Collection::Medications, "med-1", at(4)));

        let json = serde_json::to_string(&state).unwrap();
        let back: SyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    proptest! {
        #[test]
        fn watermarks_are_monotonic(offsets in prop::collection::vec(-1000i64..1000, 1..32)) {
            let mut state = SyncState::new("conn-1", ConflictPolicy::ServerWins);
            let base = at(15);
            let mut previous: Option<DateTime<Utc>> = None;
            for offset in offsets {
                state.advance_watermark(ResourceType::Condition, base + Duration::minutes(offset));
                let current = state.watermark(ResourceType::Condition);
                if let Some(prev) = previous {
                    prop_assert!(current.unwrap() >= prev);
                }
                previous = current;
            }
        }
    }
}
