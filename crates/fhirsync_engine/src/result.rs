//! Outcome of a sync pass.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use fhirsync_model::{
    Allergy, Collection, Condition, DomainRecord, LabResult, MappingError, Medication,
    ResourceType, SyncConflict, Vaccination,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Options for one call to `sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore watermarks and re-fetch everything.
    pub full_refresh: bool,
    /// The pass runs unattended. Affects status metadata only.
    pub background: bool,
}

impl SyncOptions {
    /// Options for a forced full refresh.
    pub fn full_refresh() -> Self {
        Self {
            full_refresh: true,
            background: false,
        }
    }

    /// Options for a scheduled pass.
    pub fn background() -> Self {
        Self {
            full_refresh: false,
            background: true,
        }
    }
}

/// Category of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Missing or rejected credentials.
    Authentication,
    /// The fetcher failed.
    Fetch,
    /// One resource could not be normalized.
    Mapping,
    /// A store failed.
    Store,
    /// Anything else.
    Internal,
}

/// An error reported in a [`SyncResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    /// Error category.
    pub kind: SyncErrorKind,
    /// Resource type involved, for per-resource errors.
    pub resource_type: Option<ResourceType>,
    /// ID of the offending resource, when it has one.
    pub resource_id: Option<String>,
    /// Description.
    pub message: String,
    /// Whether retrying later may succeed without user action.
    pub recoverable: bool,
}

impl SyncError {
    /// Wraps an error that aborted a pass.
    pub fn from_pass_failure(error: &EngineError) -> Self {
        let kind = match error {
            EngineError::NotAuthenticated | EngineError::AuthenticationFailed(_) => {
                SyncErrorKind::Authentication
            }
            EngineError::Fetch { .. } => SyncErrorKind::Fetch,
            EngineError::Mapping { .. } => SyncErrorKind::Mapping,
            EngineError::Store(_) | EngineError::StateStore(_) => SyncErrorKind::Store,
            _ => SyncErrorKind::Internal,
        };
        let resource_type = match error {
            EngineError::Mapping { resource_type, .. } => Some(*resource_type),
            _ => None,
        };
        Self {
            kind,
            resource_type,
            resource_id: None,
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }

    /// Creates a per-resource mapping error. Always recoverable.
    pub fn mapping(
        resource_type: ResourceType,
        resource_id: Option<String>,
        error: &MappingError,
    ) -> Self {
        Self {
            kind: SyncErrorKind::Mapping,
            resource_type: Some(resource_type),
            resource_id,
            message: error.to_string(),
            recoverable: true,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resource_type, &self.resource_id) {
            (Some(t), Some(id)) => write!(f, "{t}/{id}: {}", self.message),
            (Some(t), None) => write!(f, "{t}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Records actually written to the local store during a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewData {
    /// Applied conditions.
    pub conditions: Vec<Condition>,
    /// Applied medications.
    pub medications: Vec<Medication>,
    /// Applied lab results.
    pub lab_results: Vec<LabResult>,
    /// Applied allergies.
    pub allergies: Vec<Allergy>,
    /// Applied vaccinations.
    pub vaccinations: Vec<Vaccination>,
}

impl NewData {
    /// Adds an applied record to its collection.
    pub fn push(&mut self, record: DomainRecord) {
        match record {
            DomainRecord::Condition(r) => self.conditions.push(r),
            DomainRecord::Medication(r) => self.medications.push(r),
            DomainRecord::LabResult(r) => self.lab_results.push(r),
            DomainRecord::Allergy(r) => self.allergies.push(r),
            DomainRecord::Vaccination(r) => self.vaccinations.push(r),
        }
    }

    /// Returns the number of applied records in a collection.
    pub fn count(&self, collection: Collection) -> usize {
        match collection {
            Collection::Conditions => self.conditions.len(),
            Collection::Medications => self.medications.len(),
            Collection::LabResults => self.lab_results.len(),
            Collection::Allergies => self.allergies.len(),
            Collection::Vaccinations => self.vaccinations.len(),
        }
    }

    /// Returns the number of applied records.
    pub fn len(&self) -> usize {
        Collection::ALL.iter().map(|c| self.count(*c)).sum()
    }

    /// Returns true if nothing was applied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable summary of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Whether the pass completed.
    pub success: bool,
    /// Connection the pass ran against, if one was available.
    pub connection_id: Option<String>,
    /// When the pass finished.
    pub timestamp: DateTime<Utc>,
    /// Whether the pass ignored watermarks.
    pub full_refresh: bool,
    /// Fetched items per resource type.
    pub items_synced: BTreeMap<ResourceType, usize>,
    /// Conflicts detected in this pass, resolved or not.
    pub conflicts: Vec<SyncConflict>,
    /// Per-resource errors, or the single error that aborted the pass.
    pub errors: Vec<SyncError>,
    /// Records written to the local store.
    pub new_data: NewData,
    /// When the next pass is due.
    pub next_sync_at: DateTime<Utc>,
    /// Wall time spent in the pass.
    pub duration: Duration,
}

impl SyncResult {
    /// Builds the result of an aborted pass.
    pub fn failed(
        connection_id: Option<String>,
        timestamp: DateTime<Utc>,
        full_refresh: bool,
        error: &EngineError,
        next_sync_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            connection_id,
            timestamp,
            full_refresh,
            items_synced: BTreeMap::new(),
            conflicts: Vec::new(),
            errors: vec![SyncError::from_pass_failure(error)],
            new_data: NewData::default(),
            next_sync_at,
            duration,
        }
    }

    /// Returns the conflicts still waiting for manual resolution.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// Returns the total number of fetched items.
    pub fn total_synced(&self) -> usize {
        self.items_synced.values().sum()
    }
}

/// Why a sync is or is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncNeedReason {
    /// No pass has ever succeeded.
    NeverSynced,
    /// The sync interval has elapsed since the last success.
    IntervalElapsed,
    /// The last success is within the sync interval.
    RecentlySynced,
}

impl fmt::Display for SyncNeedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncNeedReason::NeverSynced => "no successful sync yet",
            SyncNeedReason::IntervalElapsed => "sync interval elapsed",
            SyncNeedReason::RecentlySynced => "synced recently",
        })
    }
}

/// Answer of `is_sync_needed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNeed {
    /// Whether a pass should run.
    pub needed: bool,
    /// Why.
    pub reason: SyncNeedReason,
}

impl SyncNeed {
    pub(crate) fn from_reason(reason: SyncNeedReason) -> Self {
        Self {
            needed: !matches!(reason, SyncNeedReason::RecentlySynced),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_failure_classification() {
        let auth = SyncError::from_pass_failure(&EngineError::AuthenticationFailed(
            "token revoked".into(),
        ));
        assert_eq!(auth.kind, SyncErrorKind::Authentication);
        assert!(!auth.recoverable);

        let fetch = SyncError::from_pass_failure(&EngineError::fetch_retryable("timeout"));
        assert_eq!(fetch.kind, SyncErrorKind::Fetch);
        assert!(fetch.recoverable);

        let store = SyncError::from_pass_failure(&EngineError::StateStore("locked".into()));
        assert_eq!(store.kind, SyncErrorKind::Store);
        assert!(store.recoverable);
    }

    #[test]
    fn mapping_error_display() {
        let error = SyncError::mapping(
            ResourceType::Observation,
            Some("obs-9".into()),
            &MappingError::MissingField("code"),
        );
        assert!(error.recoverable);
        assert_eq!(
            error.to_string(),
            "Observation/obs-9: missing required field `code`"
        );
    }

    #[test]
    fn failed_result_has_single_error() {
        let now = Utc::now();
        let result = SyncResult::failed(
            Some("conn-1".into()),
            now,
            false,
            &EngineError::NotAuthenticated,
            now,
            Duration::ZERO,
        );
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.errors[0].recoverable);
        assert!(result.new_data.is_empty());
    }

    #[test]
    fn need_reason() {
        assert!(SyncNeed::from_reason(SyncNeedReason::NeverSynced).needed);
        assert!(SyncNeed::from_reason(SyncNeedReason::IntervalElapsed).needed);
        assert!(!SyncNeed::from_reason(SyncNeedReason::RecentlySynced).needed);
    }
}
