//! Conflict detection and resolution.

use crate::record::{DomainRecord, RecordMeta};
use crate::resource::{Collection, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fields that identify a record rather than describe it.
const IDENTITY_FIELDS: [&str; 2] = ["external_reference", "last_updated"];

/// A disagreement between the server and the local copy of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict ID.
    pub id: Uuid,
    /// FHIR resource type of the record.
    pub resource_type: ResourceType,
    /// External reference of the record.
    pub resource_id: String,
    /// Incoming server version.
    pub server_value: DomainRecord,
    /// Current local version.
    pub local_value: DomainRecord,
    /// First field in disagreement.
    pub field: String,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Whether the conflict has been settled.
    pub resolved: bool,
    /// How it was settled.
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    /// Creates an unresolved conflict between two versions of a record.
    pub fn new(
        server_value: DomainRecord,
        local_value: DomainRecord,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let field = differing_field(&server_value, &local_value);
        Self {
            id: Uuid::new_v4(),
            resource_type: server_value.collection().resource_type(),
            resource_id: server_value.external_reference().to_string(),
            server_value,
            local_value,
            field,
            detected_at,
            resolved: false,
            resolution: None,
        }
    }

    /// Returns the local collection of the record in conflict.
    pub fn collection(&self) -> Collection {
        self.server_value.collection()
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolved = true;
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

/// Returns the first descriptive field whose value differs.
///
/// Falls back to `last_updated` when only the timestamps disagree.
pub fn differing_field(a: &DomainRecord, b: &DomainRecord) -> String {
    let left = a.to_fields();
    let right = b.to_fields();
    let keys: BTreeSet<&str> = left
        .as_object()
        .into_iter()
        .chain(right.as_object())
        .flat_map(|map| map.keys().map(String::as_str))
        .filter(|key| !IDENTITY_FIELDS.contains(key))
        .collect();

    let field = keys
        .into_iter()
        .find(|key| left.get(*key) != right.get(*key))
        .unwrap_or("last_updated");
    field.to_string()
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Accept the server version.
    Server,
    /// Keep the local version.
    Client,
    /// Store a caller-provided merge of both.
    Merged,
}

impl ConflictResolution {
    /// Returns the lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Server => "server",
            ConflictResolution::Client => "client",
            ConflictResolution::Merged => "merged",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(ConflictResolution::Server),
            "client" => Ok(ConflictResolution::Client),
            "merged" => Ok(ConflictResolution::Merged),
            other => Err(format!("unknown conflict resolution: {other}")),
        }
    }
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Server always wins.
    #[default]
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Manual resolution required.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Resolves a conflict according to this policy.
    ///
    /// `Manual` leaves the conflict untouched for later intervention.
    pub fn resolve(&self, conflict: &mut SyncConflict) {
        match self {
            ConflictPolicy::ServerWins => conflict.resolve(ConflictResolution::Server),
            ConflictPolicy::ClientWins => conflict.resolve(ConflictResolution::Client),
            ConflictPolicy::Manual => {}
        }
    }

    /// Returns the kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-wins" => Ok(ConflictPolicy::ServerWins),
            "client-wins" => Ok(ConflictPolicy::ClientWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}
