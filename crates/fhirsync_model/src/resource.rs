//! FHIR resource types and the local collections they land in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A FHIR resource type that the engine knows how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// The patient the connection belongs to.
    Patient,
    /// Problems and diagnoses.
    Condition,
    /// Prescriptions.
    MedicationRequest,
    /// Lab results and other observations.
    Observation,
    /// Allergies and intolerances.
    AllergyIntolerance,
    /// Administered vaccines.
    Immunization,
}

impl ResourceType {
    /// The resource types fetched when nothing else is configured.
    pub const DEFAULTS: [ResourceType; 6] = [
        ResourceType::Patient,
        ResourceType::Condition,
        ResourceType::MedicationRequest,
        ResourceType::Observation,
        ResourceType::AllergyIntolerance,
        ResourceType::Immunization,
    ];

    /// Returns the FHIR name of this resource type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Condition => "Condition",
            ResourceType::MedicationRequest => "MedicationRequest",
            ResourceType::Observation => "Observation",
            ResourceType::AllergyIntolerance => "AllergyIntolerance",
            ResourceType::Immunization => "Immunization",
        }
    }

    /// Returns the local collection this type is reconciled into.
    ///
    /// `Patient` is fetched for context only and has no collection.
    pub fn collection(&self) -> Option<Collection> {
        match self {
            ResourceType::Patient => None,
            ResourceType::Condition => Some(Collection::Conditions),
            ResourceType::MedicationRequest => Some(Collection::Medications),
            ResourceType::Observation => Some(Collection::LabResults),
            ResourceType::AllergyIntolerance => Some(Collection::Allergies),
            ResourceType::Immunization => Some(Collection::Vaccinations),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown resource type name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown resource type: {0}")]
pub struct ParseResourceTypeError(pub String);

impl FromStr for ResourceType {
    type Err = ParseResourceTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::DEFAULTS
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseResourceTypeError(s.to_string()))
    }
}

/// One of the five normalized collections in the local data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Normalized `Condition` resources.
    Conditions,
    /// Normalized `MedicationRequest` resources.
    Medications,
    /// Normalized `Observation` resources.
    LabResults,
    /// Normalized `AllergyIntolerance` resources.
    Allergies,
    /// Normalized `Immunization` resources.
    Vaccinations,
}

impl Collection {
    /// All collections in reconciliation order.
    pub const ALL: [Collection; 5] = [
        Collection::Conditions,
        Collection::Medications,
        Collection::LabResults,
        Collection::Allergies,
        Collection::Vaccinations,
    ];

    /// Returns the FHIR resource type feeding this collection.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Collection::Conditions => ResourceType::Condition,
            Collection::Medications => ResourceType::MedicationRequest,
            Collection::LabResults => ResourceType::Observation,
            Collection::Allergies => ResourceType::AllergyIntolerance,
            Collection::Vaccinations => ResourceType::Immunization,
        }
    }

    /// Returns false for append-only collections.
    ///
    /// Immunizations are historical facts: once stored they are never
    /// overwritten, only new references are inserted.
    pub fn supports_update(&self) -> bool {
        !matches!(self, Collection::Vaccinations)
    }

    /// Returns true if incoming changes bypass conflict detection.
    ///
    /// The server is authoritative for clinical lab results.
    pub fn server_authoritative(&self) -> bool {
        matches!(self, Collection::LabResults)
    }

    /// Returns the snake_case name used in logs and file formats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Conditions => "conditions",
            Collection::Medications => "medications",
            Collection::LabResults => "lab_results",
            Collection::Allergies => "allergies",
            Collection::Vaccinations => "vaccinations",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
