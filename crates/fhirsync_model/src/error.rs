//! Error types for resource mapping.

use thiserror::Error;

/// Errors raised while normalizing one raw FHIR resource.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    /// The resource is not a JSON object.
    #[error("resource is not a JSON object")]
    NotAnObject,

    /// The resource declares a different `resourceType`.
    #[error("expected resourceType {expected}, found {found}")]
    UnexpectedResourceType {
        /// Resource type the mapper handles.
        expected: &'static str,
        /// Resource type found on the resource.
        found: String,
    },

    /// A required field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A timestamp field could not be parsed.
    #[error("invalid timestamp in `{field}`: {value}")]
    InvalidTimestamp {
        /// Field path.
        field: &'static str,
        /// Raw value.
        value: String,
    },
}
