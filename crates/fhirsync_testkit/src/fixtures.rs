//! FHIR JSON fixtures and normalized record helpers.
//!
//! Timestamps are RFC 3339 strings so tests read like the wire format.

use chrono::{DateTime, Utc};
use fhirsync_model::{
    Allergy, Collection, Condition, DomainRecord, FetchedResources, LabResult, MapOptions,
    Medication, R4Mapper, Vaccination,
};
use serde_json::{json, Value};

/// Parses an RFC 3339 timestamp or a `YYYY-MM-DD` date.
pub fn ts(value: &str) -> DateTime<Utc> {
    fhirsync_model::mapping::parse_timestamp("fixture", value).expect("Invalid fixture timestamp")
}

fn meta(last_updated: &str) -> Value {
    json!({ "lastUpdated": last_updated })
}

/// A `Patient` resource.
pub fn patient_json(id: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{ "family": "Doe", "given": ["Jane"] }],
        "birthDate": "1980-04-12"
    })
}

/// A `Condition` resource.
pub fn condition_json(id: &str, last_updated: &str, name: &str) -> Value {
    json!({
        "resourceType": "Condition",
        "id": id,
        "meta": meta(last_updated),
        "clinicalStatus": {
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/condition-clinical",
                "code": "active"
            }]
        },
        "code": { "text": name },
        "onsetDateTime": "2019-06-01"
    })
}

/// A `MedicationRequest` resource.
pub fn medication_json(id: &str, last_updated: &str, name: &str, dosage: &str) -> Value {
    json!({
        "resourceType": "MedicationRequest",
        "id": id,
        "meta": meta(last_updated),
        "status": "active",
        "medicationCodeableConcept": { "text": name },
        "dosageInstruction": [{ "text": dosage }],
        "authoredOn": "2023-11-20"
    })
}

/// An `Observation` resource with a quantity value.
pub fn observation_json(id: &str, last_updated: &str, name: &str, value: f64, unit: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "meta": meta(last_updated),
        "status": "final",
        "code": { "text": name },
        "valueQuantity": { "value": value, "unit": unit },
        "effectiveDateTime": "2024-01-15T08:30:00Z"
    })
}

/// An `AllergyIntolerance` resource.
pub fn allergy_json(id: &str, last_updated: &str, substance: &str) -> Value {
    json!({
        "resourceType": "AllergyIntolerance",
        "id": id,
        "meta": meta(last_updated),
        "criticality": "high",
        "code": { "text": substance },
        "reaction": [{ "manifestation": [{ "text": "Hives" }] }]
    })
}

/// An `Immunization` resource.
pub fn immunization_json(id: &str, last_updated: &str, vaccine: &str) -> Value {
    json!({
        "resourceType": "Immunization",
        "id": id,
        "meta": meta(last_updated),
        "status": "completed",
        "vaccineCode": { "text": vaccine },
        "occurrenceDateTime": "2023-10-01"
    })
}

/// A resource the reference mapper rejects: no timestamp and no code.
pub fn malformed_json(resource_type: &str, id: &str) -> Value {
    json!({ "resourceType": resource_type, "id": id })
}

/// A `searchset` bundle over the given resources.
pub fn bundle_json(resources: Vec<Value>) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": resources.len(),
        "entry": resources
            .into_iter()
            .map(|resource| json!({ "resource": resource }))
            .collect::<Vec<_>>()
    })
}

/// Maps a fixture through the reference mapper.
pub fn mapped(collection: Collection, raw: &Value) -> DomainRecord {
    R4Mapper
        .map(collection, raw, &MapOptions::default())
        .expect("Fixture failed to map")
}

/// A normalized condition matching [`condition_json`].
pub fn condition(id: &str, last_updated: &str, name: &str) -> Condition {
    R4Mapper
        .map_condition(&condition_json(id, last_updated, name), &MapOptions::default())
        .expect("Fixture failed to map")
}

/// A normalized medication matching [`medication_json`].
pub fn medication(id: &str, last_updated: &str, name: &str, dosage: &str) -> Medication {
    R4Mapper
        .map_medication(
            &medication_json(id, last_updated, name, dosage),
            &MapOptions::default(),
        )
        .expect("Fixture failed to map")
}

/// A normalized lab result matching [`observation_json`].
pub fn lab_result(id: &str, last_updated: &str, name: &str, value: f64, unit: &str) -> LabResult {
    R4Mapper
        .map_lab_result(
            &observation_json(id, last_updated, name, value, unit),
            &MapOptions::default(),
        )
        .expect("Fixture failed to map")
}

/// A normalized allergy matching [`allergy_json`].
pub fn allergy(id: &str, last_updated: &str, substance: &str) -> Allergy {
    R4Mapper
        .map_allergy(&allergy_json(id, last_updated, substance), &MapOptions::default())
        .expect("Fixture failed to map")
}

/// A normalized vaccination matching [`immunization_json`].
pub fn vaccination(id: &str, last_updated: &str, vaccine: &str) -> Vaccination {
    R4Mapper
        .map_vaccination(
            &immunization_json(id, last_updated, vaccine),
            &MapOptions::default(),
        )
        .expect("Fixture failed to map")
}

/// One of every resource type, all updated at `last_updated`.
pub fn sample_fetch(last_updated: &str) -> FetchedResources {
    FetchedResources {
        patient: Some(patient_json("pat-1")),
        conditions: vec![
            condition_json("cond-1", last_updated, "Type 2 diabetes"),
            condition_json("cond-2", last_updated, "Hypertension"),
        ],
        medications: vec![medication_json(
            "med-1",
            last_updated,
            "Metformin",
            "500mg twice daily",
        )],
        observations: vec![observation_json(
            "obs-1",
            last_updated,
            "HbA1c",
            6.8,
            "%",
        )],
        allergies: vec![allergy_json("alg-1", last_updated, "Penicillin")],
        immunizations: vec![immunization_json("imm-1", last_updated, "Influenza")],
    }
}
