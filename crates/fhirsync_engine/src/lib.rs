//! # fhirsync engine
//!
//! Pulls clinical resources from a FHIR server into a local store.
//!
//! This crate provides:
//! - The `SyncEngine` pass state machine
//!   (checking → fetching → comparing → resolving → applying → completed)
//! - Full vs incremental fetch decisions and per-type watermarks
//! - Conflict detection against queued local edits, resolved per policy
//! - A recurring background scheduler with a single-flight guard
//! - Observable status with subscribe/unsubscribe
//! - Collaborator traits with in-memory implementations for tests
//! - A FHIR REST fetcher over a pluggable HTTP client
//!
//! ## Pass outline
//!
//! 1. Load the connection's `SyncState`
//! 2. Full refresh if requested, never synced, or data older than the
//!    maximum age; otherwise fetch everything updated since `last_sync_at`
//! 3. Map and diff each collection by external reference
//! 4. Settle conflicts per policy, parking manual ones
//! 5. Write changes, re-checking existence in the store
//! 6. Advance watermarks and persist the checkpoint
//!
//! ## Key Invariants
//!
//! - `sync()` always returns a `SyncResult`; it never errors
//! - A failed pass leaves the persisted state untouched
//! - Watermarks never move backwards
//! - Vaccinations are only ever inserted
//! - Lab results always take the server value

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod engine;
mod error;
mod fetcher;
mod mapper;
pub mod reconcile;
mod rest;
mod result;
mod scheduler;
mod status;
mod store;

pub use auth::{AccessToken, AuthenticatedClient, Authenticator, Connection, StaticAuthenticator};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult};
pub use fetcher::{MockFetcher, ResourceFetcher};
pub use mapper::ResourceMapper;
pub use rest::{search_url, FhirHttpClient, HttpResponse, RestFetcher};
pub use result::{
    NewData, SyncError, SyncErrorKind, SyncNeed, SyncNeedReason, SyncOptions, SyncResult,
};
pub use status::{
    StatusCallback, StatusObservers, Subscription, SyncProgress, SyncStatus, SyncStatusInfo,
};
pub use store::{
    LocalDataStore, MemoryLocalStore, MemorySyncStateStore, StoreCall, SyncStateStore,
};
