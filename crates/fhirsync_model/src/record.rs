//! Normalized domain records.
//!
//! Every record carries an `external_reference` tying it back to the
//! remote FHIR resource. That reference, not a local id, is the natural
//! key used for reconciliation.

use crate::resource::Collection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accessors shared by all normalized records.
pub trait RecordMeta {
    /// Stable identifier of the originating FHIR resource.
    fn external_reference(&self) -> &str;

    /// Last time the originating resource changed on the server.
    fn last_updated(&self) -> DateTime<Utc>;
}

/// A coded concept reduced to its first coding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    /// Code system URI.
    pub system: Option<String>,
    /// Code within the system.
    pub code: Option<String>,
    /// Human readable display.
    pub display: Option<String>,
}

/// A normalized problem or diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Reference to the FHIR `Condition`.
    pub external_reference: String,
    /// Server-side update time.
    pub last_updated: DateTime<Utc>,
    /// Display name.
    pub name: String,
    /// Primary coding.
    pub code: Option<Coding>,
    /// Clinical status (`active`, `resolved`, ...).
    pub clinical_status: Option<String>,
    /// Onset date as reported by the server.
    pub onset: Option<String>,
    /// Free text notes.
    pub notes: Option<String>,
}

/// A normalized prescription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    /// Reference to the FHIR `MedicationRequest`.
    pub external_reference: String,
    /// Server-side update time.
    pub last_updated: DateTime<Utc>,
    /// Medication name.
    pub name: String,
    /// Primary coding.
    pub code: Option<Coding>,
    /// Request status (`active`, `stopped`, ...).
    pub status: Option<String>,
    /// Dosage instructions.
    pub dosage: Option<String>,
    /// Date the prescription was written.
    pub prescribed_on: Option<String>,
    /// Prescriber display name.
    pub prescriber: Option<String>,
}

/// A normalized lab result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResult {
    /// Reference to the FHIR `Observation`.
    pub external_reference: String,
    /// Server-side update time.
    pub last_updated: DateTime<Utc>,
    /// Test name.
    pub name: String,
    /// Primary coding.
    pub code: Option<Coding>,
    /// Numeric value, when the result is a quantity.
    pub value: Option<f64>,
    /// Unit of `value`.
    pub unit: Option<String>,
    /// Textual value, when the result is not numeric.
    pub value_text: Option<String>,
    /// Reference range as text.
    pub reference_range: Option<String>,
    /// Interpretation (`H`, `L`, `N`, ...).
    pub interpretation: Option<String>,
    /// When the sample was taken.
    pub effective_at: Option<String>,
}

/// A normalized allergy or intolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allergy {
    /// Reference to the FHIR `AllergyIntolerance`.
    pub external_reference: String,
    /// Server-side update time.
    pub last_updated: DateTime<Utc>,
    /// Substance the patient reacts to.
    pub substance: String,
    /// Primary coding.
    pub code: Option<Coding>,
    /// Criticality (`low`, `high`, `unable-to-assess`).
    pub criticality: Option<String>,
    /// Reported reaction manifestations.
    pub reactions: Vec<String>,
    /// Clinical status.
    pub clinical_status: Option<String>,
    /// Date the allergy was recorded.
    pub recorded_on: Option<String>,
}

/// A normalized immunization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vaccination {
    /// Reference to the FHIR `Immunization`.
    pub external_reference: String,
    /// Server-side update time.
    pub last_updated: DateTime<Utc>,
    /// Vaccine name.
    pub vaccine: String,
    /// Primary coding.
    pub code: Option<Coding>,
    /// Administration date.
    pub occurred_on: Option<String>,
    /// Lot number.
    pub lot_number: Option<String>,
    /// Event status (`completed`, `not-done`, ...).
    pub status: Option<String>,
}

macro_rules! impl_record_meta {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RecordMeta for $ty {
                fn external_reference(&self) -> &str {
                    &self.external_reference
                }

                fn last_updated(&self) -> DateTime<Utc> {
                    self.last_updated
                }
            }
        )*
    };
}

impl_record_meta!(Condition, Medication, LabResult, Allergy, Vaccination);

/// Any normalized record, tagged with its collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainRecord {
    /// A condition.
    Condition(Condition),
    /// A medication.
    Medication(Medication),
    /// A lab result.
    LabResult(LabResult),
    /// An allergy.
    Allergy(Allergy),
    /// A vaccination.
    Vaccination(Vaccination),
}

impl DomainRecord {
    /// Returns the collection this record belongs to.
    pub fn collection(&self) -> Collection {
        match self {
            DomainRecord::Condition(_) => Collection::Conditions,
            DomainRecord::Medication(_) => Collection::Medications,
            DomainRecord::LabResult(_) => Collection::LabResults,
            DomainRecord::Allergy(_) => Collection::Allergies,
            DomainRecord::Vaccination(_) => Collection::Vaccinations,
        }
    }

    fn meta(&self) -> &dyn RecordMeta {
        match self {
            DomainRecord::Condition(r) => r,
            DomainRecord::Medication(r) => r,
            DomainRecord::LabResult(r) => r,
            DomainRecord::Allergy(r) => r,
            DomainRecord::Vaccination(r) => r,
        }
    }

    /// Serializes the record body (without the kind tag) to JSON.
    pub fn to_fields(&self) -> serde_json::Value {
        let body = match self {
            DomainRecord::Condition(r) => serde_json::to_value(r),
            DomainRecord::Medication(r) => serde_json::to_value(r),
            DomainRecord::LabResult(r) => serde_json::to_value(r),
            DomainRecord::Allergy(r) => serde_json::to_value(r),
            DomainRecord::Vaccination(r) => serde_json::to_value(r),
        };
        body.unwrap_or(serde_json::Value::Null)
    }
}

impl RecordMeta for DomainRecord {
    fn external_reference(&self) -> &str {
        self.meta().external_reference()
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.meta().last_updated()
    }
}

impl From<Condition> for DomainRecord {
    fn from(record: Condition) -> Self {
        DomainRecord::Condition(record)
    }
}

impl From<Medication> for DomainRecord {
    fn from(record: Medication) -> Self {
        DomainRecord::Medication(record)
    }
}

impl From<LabResult> for DomainRecord {
    fn from(record: LabResult) -> Self {
        DomainRecord::LabResult(record)
    }
}

impl From<Allergy> for DomainRecord {
    fn from(record: Allergy) -> Self {
        DomainRecord::Allergy(record)
    }
}

impl From<Vaccination> for DomainRecord {
    fn from(record: Vaccination) -> Self {
        DomainRecord::Vaccination(record)
    }
}
