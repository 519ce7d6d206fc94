//! Reference mapper from FHIR R4 JSON to normalized records.
//!
//! The mapper is deliberately shallow: it lifts the handful of fields the
//! local collections keep and ignores everything else. Each function is
//! pure and fails only when a resource cannot be keyed or dated.

use crate::error::MappingError;
use crate::record::{Allergy, Coding, Condition, DomainRecord, LabResult, Medication, Vaccination};
use crate::resource::Collection;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

const TRANSLATION_URL: &str = "http://hl7.org/fhir/StructureDefinition/translation";

/// Options passed to every mapping call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    /// BCP-47 language used to pick translated display text.
    pub preferred_language: String,
}

impl MapOptions {
    /// Creates options for a preferred language.
    pub fn new(preferred_language: impl Into<String>) -> Self {
        Self {
            preferred_language: preferred_language.into(),
        }
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::new("en")
    }
}

/// Maps FHIR R4 resources into normalized records.
#[derive(Debug, Clone, Copy, Default)]
pub struct R4Mapper;

impl R4Mapper {
    /// Maps a raw resource into the record type of `collection`.
    pub fn map(
        &self,
        collection: Collection,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<DomainRecord, MappingError> {
        Ok(match collection {
            Collection::Conditions => self.map_condition(raw, options)?.into(),
            Collection::Medications => self.map_medication(raw, options)?.into(),
            Collection::LabResults => self.map_lab_result(raw, options)?.into(),
            Collection::Allergies => self.map_allergy(raw, options)?.into(),
            Collection::Vaccinations => self.map_vaccination(raw, options)?.into(),
        })
    }

    /// Maps a `Condition`.
    pub fn map_condition(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Condition, MappingError> {
        let resource = Resource::open(raw, "Condition")?;
        let code = resource.get("code");
        let notes: Vec<&str> = resource
            .array("note")
            .iter()
            .filter_map(|n| n.get("text").and_then(Value::as_str))
            .collect();

        Ok(Condition {
            external_reference: resource.id()?,
            last_updated: resource.last_updated(&["recordedDate", "onsetDateTime"])?,
            name: code
                .and_then(|c| concept_name(c, options))
                .ok_or(MappingError::MissingField("code"))?,
            code: code.and_then(first_coding),
            clinical_status: resource.get("clinicalStatus").and_then(coding_code),
            onset: resource
                .text("onsetDateTime")
                .or_else(|| resource.text("onsetString"))
                .or_else(|| {
                    resource
                        .get("onsetPeriod")
                        .and_then(|p| p.get("start"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
            notes: (!notes.is_empty()).then(|| notes.join("\n")),
        })
    }

    /// Maps a `MedicationRequest`.
    pub fn map_medication(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Medication, MappingError> {
        let resource = Resource::open(raw, "MedicationRequest")?;
        let concept = resource.get("medicationCodeableConcept");
        let name = concept
            .and_then(|c| concept_name(c, options))
            .or_else(|| {
                resource
                    .get("medicationReference")
                    .and_then(|r| r.get("display"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or(MappingError::MissingField("medicationCodeableConcept"))?;

        Ok(Medication {
            external_reference: resource.id()?,
            last_updated: resource.last_updated(&["authoredOn"])?,
            name,
            code: concept.and_then(first_coding),
            status: resource.text("status"),
            dosage: resource
                .array("dosageInstruction")
                .first()
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            prescribed_on: resource.text("authoredOn"),
            prescriber: resource
                .get("requester")
                .and_then(|r| r.get("display"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Maps an `Observation`.
    pub fn map_lab_result(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<LabResult, MappingError> {
        let resource = Resource::open(raw, "Observation")?;
        let code = resource.get("code");
        let quantity = resource.get("valueQuantity");

        Ok(LabResult {
            external_reference: resource.id()?,
            last_updated: resource.last_updated(&["issued", "effectiveDateTime"])?,
            name: code
                .and_then(|c| concept_name(c, options))
                .ok_or(MappingError::MissingField("code"))?,
            code: code.and_then(first_coding),
            value: quantity.and_then(|q| q.get("value")).and_then(Value::as_f64),
            unit: quantity.and_then(|q| {
                q.get("unit")
                    .or_else(|| q.get("code"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
            value_text: resource.text("valueString").or_else(|| {
                resource
                    .get("valueCodeableConcept")
                    .and_then(|c| concept_name(c, options))
            }),
            reference_range: resource.array("referenceRange").first().and_then(range_text),
            interpretation: resource
                .array("interpretation")
                .first()
                .and_then(coding_code),
            effective_at: resource.text("effectiveDateTime").or_else(|| {
                resource
                    .get("effectivePeriod")
                    .and_then(|p| p.get("start"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
        })
    }

    /// Maps an `AllergyIntolerance`.
    pub fn map_allergy(&self, raw: &Value, options: &MapOptions) -> Result<Allergy, MappingError> {
        let resource = Resource::open(raw, "AllergyIntolerance")?;
        let code = resource.get("code");
        let reactions = resource.array("reaction");
        let substance = code
            .and_then(|c| concept_name(c, options))
            .or_else(|| {
                reactions
                    .first()
                    .and_then(|r| r.get("substance"))
                    .and_then(|s| concept_name(s, options))
            })
            .ok_or(MappingError::MissingField("code"))?;

        Ok(Allergy {
            external_reference: resource.id()?,
            last_updated: resource.last_updated(&["recordedDate", "lastOccurrence"])?,
            substance,
            code: code.and_then(first_coding),
            criticality: resource.text("criticality"),
            reactions: reactions
                .iter()
                .flat_map(|r| {
                    r.get("manifestation")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                })
                .filter_map(|m| concept_name(m, options))
                .collect(),
            clinical_status: resource.get("clinicalStatus").and_then(coding_code),
            recorded_on: resource.text("recordedDate"),
        })
    }

    /// Maps an `Immunization`.
    pub fn map_vaccination(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Vaccination, MappingError> {
        let resource = Resource::open(raw, "Immunization")?;
        let code = resource.get("vaccineCode");

        Ok(Vaccination {
            external_reference: resource.id()?,
            last_updated: resource.last_updated(&["recorded", "occurrenceDateTime"])?,
            vaccine: code
                .and_then(|c| concept_name(c, options))
                .ok_or(MappingError::MissingField("vaccineCode"))?,
            code: code.and_then(first_coding),
            occurred_on: resource
                .text("occurrenceDateTime")
                .or_else(|| resource.text("occurrenceString")),
            lot_number: resource.text("lotNumber"),
            status: resource.text("status"),
        })
    }
}

/// A raw resource checked to be an object of the expected type.
struct Resource<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Resource<'a> {
    fn open(raw: &'a Value, expected: &'static str) -> Result<Self, MappingError> {
        let fields = raw.as_object().ok_or(MappingError::NotAnObject)?;
        match fields.get("resourceType").and_then(Value::as_str) {
            Some(found) if found != expected => Err(MappingError::UnexpectedResourceType {
                expected,
                found: found.to_string(),
            }),
            _ => Ok(Self { fields }),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.fields.get(key)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn array(&self, key: &str) -> &'a [Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn id(&self) -> Result<String, MappingError> {
        self.text("id")
            .filter(|id| !id.is_empty())
            .ok_or(MappingError::MissingField("id"))
    }

    /// `meta.lastUpdated`, falling back to clinical dates in order.
    fn last_updated(&self, fallbacks: &[&'static str]) -> Result<DateTime<Utc>, MappingError> {
        if let Some(value) = self
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
        {
            return parse_timestamp("meta.lastUpdated", value);
        }
        for &field in fallbacks {
            if let Some(value) = self.get(field).and_then(Value::as_str) {
                return parse_timestamp(field, value);
            }
        }
        Err(MappingError::MissingField("meta.lastUpdated"))
    }
}

/// Parses a FHIR `instant`, `dateTime` or `date` into UTC.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, MappingError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MappingError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Picks a display name for a `CodeableConcept`.
///
/// Order: translated text in the preferred language, `text`, then the
/// first coding's display, then its code.
fn concept_name(concept: &Value, options: &MapOptions) -> Option<String> {
    translated_text(concept, &options.preferred_language)
        .or_else(|| concept.get("text").and_then(Value::as_str).map(str::to_string))
        .or_else(|| {
            let coding = concept.get("coding")?.as_array()?.first()?;
            coding
                .get("display")
                .or_else(|| coding.get("code"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|name| !name.trim().is_empty())
}

fn translated_text(concept: &Value, language: &str) -> Option<String> {
    concept
        .get("_text")?
        .get("extension")?
        .as_array()?
        .iter()
        .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(TRANSLATION_URL))
        .find_map(|ext| {
            let parts = ext.get("extension")?.as_array()?;
            let part = |name: &str, key: &str| {
                parts
                    .iter()
                    .find(|p| p.get("url").and_then(Value::as_str) == Some(name))
                    .and_then(|p| p.get(key))
                    .and_then(Value::as_str)
            };
            (part("lang", "valueCode")? == language)
                .then(|| part("content", "valueString"))
                .flatten()
                .map(str::to_string)
        })
}

fn first_coding(concept: &Value) -> Option<Coding> {
    let coding = concept.get("coding")?.as_array()?.first()?;
    let field = |key: &str| coding.get(key).and_then(Value::as_str).map(str::to_string);
    Some(Coding {
        system: field("system"),
        code: field("code"),
        display: field("display"),
    })
}

fn coding_code(concept: &Value) -> Option<String> {
    first_coding(concept).and_then(|c| c.code)
}

fn range_text(range: &Value) -> Option<String> {
    if let Some(text) = range.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let bound = |key: &str| range.get(key).and_then(|q| q.get("value")).and_then(Value::as_f64);
    let unit = range
        .get("low")
        .or_else(|| range.get("high"))
        .and_then(|q| q.get("unit"))
        .and_then(Value::as_str);
    let span = match (bound("low"), bound("high")) {
        (Some(low), Some(high)) => format!("{low}-{high}"),
        (Some(low), None) => format!(">={low}"),
        (None, Some(high)) => format!("<={high}"),
        (None, None) => return None,
    };
    Some(match unit {
        Some(unit) => format!("{span} {unit}"),
        None => span,
    })
}
