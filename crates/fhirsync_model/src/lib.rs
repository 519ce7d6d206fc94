//! # fhirsync model
//!
//! Data types shared by the fhirsync engine and its collaborators.
//!
//! This crate provides:
//! - `ResourceType` and `Collection` for the FHIR types that are synchronized
//! - Normalized domain records (`Condition`, `Medication`, `LabResult`,
//!   `Allergy`, `Vaccination`) keyed by their external reference
//! - `SyncState` checkpoints and the `PendingChange` local change queue
//! - `SyncConflict` with `ConflictPolicy` and `ConflictResolution`
//! - Fetch request/response shapes exchanged with a resource fetcher
//! - A reference FHIR R4 mapper
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod fetch;
pub mod mapping;
mod record;
mod resource;
mod state;

pub use conflict::{ConflictPolicy, ConflictResolution, SyncConflict};
pub use error::MappingError;
pub use fetch::{FetchRequest, FetchedResources};
pub use mapping::{MapOptions, R4Mapper};
pub use record::{
    Allergy, Coding, Condition, DomainRecord, LabResult, Medication, RecordMeta, Vaccination,
};
pub use resource::{Collection, ParseResourceTypeError, ResourceType};
pub use state::{PendingChange, SyncState};
