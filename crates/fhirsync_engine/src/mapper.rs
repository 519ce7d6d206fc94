//! Resource mapper abstraction.

use fhirsync_model::{
    Allergy, Collection, Condition, DomainRecord, LabResult, MapOptions, MappingError, Medication,
    R4Mapper, Vaccination,
};
use serde_json::Value;

/// Pure per-type transformation from raw FHIR JSON to normalized records.
///
/// Every produced record carries its external reference and last-updated
/// time. A failure affects only the resource being mapped.
pub trait ResourceMapper: Send + Sync {
    /// Maps a `Condition`.
    fn map_condition(&self, raw: &Value, options: &MapOptions) -> Result<Condition, MappingError>;

    /// Maps a `MedicationRequest`.
    fn map_medication(&self, raw: &Value, options: &MapOptions)
        -> Result<Medication, MappingError>;

    /// Maps an `Observation`.
    fn map_lab_result(&self, raw: &Value, options: &MapOptions) -> Result<LabResult, MappingError>;

    /// Maps an `AllergyIntolerance`.
    fn map_allergy(&self, raw: &Value, options: &MapOptions) -> Result<Allergy, MappingError>;

    /// Maps an `Immunization`.
    fn map_vaccination(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Vaccination, MappingError>;

    /// Maps a raw resource into the record type of `collection`.
    fn map(
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
}

impl ResourceMapper for R4Mapper {
    fn map_condition(&self, raw: &Value, options: &MapOptions) -> Result<Condition, MappingError> {
        R4Mapper::map_condition(self, raw, options)
    }

    fn map_medication(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Medication, MappingError> {
        R4Mapper::map_medication(self, raw, options)
    }

    fn map_lab_result(&self, raw: &Value, options: &MapOptions) -> Result<LabResult, MappingError> {
        R4Mapper::map_lab_result(self, raw, options)
    }

    fn map_allergy(&self, raw: &Value, options: &MapOptions) -> Result<Allergy, MappingError> {
        R4Mapper::map_allergy(self, raw, options)
    }

    fn map_vaccination(
        &self,
        raw: &Value,
        options: &MapOptions,
    ) -> Result<Vaccination, MappingError> {
        R4Mapper::map_vaccination(self, raw, options)
    }
}
