//! Request and response shapes exchanged with a resource fetcher.

use crate::resource::{Collection, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for one fetch from the remote FHIR server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Only resources updated after this instant. `None` means everything.
    pub since: Option<DateTime<Utc>>,
    /// Resource types to retrieve.
    pub resource_types: Vec<ResourceType>,
    /// Page size used while walking bundle pages.
    pub page_size: u32,
    /// Whether the `Patient` resource is requested.
    pub include_patient: bool,
}

impl FetchRequest {
    /// Creates a request for a full fetch of the given types.
    pub fn full(resource_types: Vec<ResourceType>, page_size: u32) -> Self {
        let include_patient = resource_types.contains(&ResourceType::Patient);
        Self {
            since: None,
            resource_types,
            page_size,
            include_patient,
        }
    }

    /// Restricts the request to resources updated after `since`.
    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Returns true if no `since` filter is set.
    pub fn is_full(&self) -> bool {
        self.since.is_none()
    }

    /// Returns true if the given type was requested.
    pub fn wants(&self, resource_type: ResourceType) -> bool {
        self.resource_types.contains(&resource_type)
    }
}

/// Raw, untransformed resources grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedResources {
    /// The patient resource, if requested and available.
    pub patient: Option<Value>,
    /// Raw `Condition` resources.
    pub conditions: Vec<Value>,
    /// Raw `MedicationRequest` resources.
    pub medications: Vec<Value>,
    /// Raw `Observation` resources.
    pub observations: Vec<Value>,
    /// Raw `AllergyIntolerance` resources.
    pub allergies: Vec<Value>,
    /// Raw `Immunization` resources.
    pub immunizations: Vec<Value>,
}

impl FetchedResources {
    /// Returns the raw resources feeding a collection.
    pub fn for_collection(&self, collection: Collection) -> &[Value] {
        match collection {
            Collection::Conditions => &self.conditions,
            Collection::Medications => &self.medications,
            Collection::LabResults => &self.observations,
            Collection::Allergies => &self.allergies,
            Collection::Vaccinations => &self.immunizations,
        }
    }

    /// Returns the bucket a raw resource of this type belongs in.
    ///
    /// Returns `None` for `Patient`, which is a single slot.
    pub fn bucket_mut(&mut self, resource_type: ResourceType) -> Option<&mut Vec<Value>> {
        match resource_type {
            ResourceType::Patient => None,
            ResourceType::Condition => Some(&mut self.conditions),
            ResourceType::MedicationRequest => Some(&mut self.medications),
            ResourceType::Observation => Some(&mut self.observations),
            ResourceType::AllergyIntolerance => Some(&mut self.allergies),
            ResourceType::Immunization => Some(&mut self.immunizations),
        }
    }

    /// Returns the number of fetched items of a resource type.
    pub fn count(&self, resource_type: ResourceType) -> usize {
        match resource_type.collection() {
            Some(collection) => self.for_collection(collection).len(),
            None => usize::from(self.patient.is_some()),
        }
    }

    /// Returns the total number of fetched items.
    pub fn total(&self) -> usize {
        ResourceType::DEFAULTS.iter().map(|t| self.count(*t)).sum()
    }
}
