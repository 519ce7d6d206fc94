//! Resolve command implementation.

use super::Context;
use fhirsync_engine::SyncConfig;
use fhirsync_model::{ConflictResolution, DomainRecord};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Settles one pending conflict.
///
/// A merged resolution reads the merged record from `record`, a JSON
/// document tagged with its `kind`.
pub async fn run(
    ctx: &Context,
    id: Uuid,
    resolution: ConflictResolution,
    record: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let merged = match record {
        Some(path) => Some(serde_json::from_slice::<DomainRecord>(&fs::read(path)?)?),
        None => None,
    };

    let engine = ctx.open(SyncConfig::default(), None)?.engine;
    engine.initialize().await?;
    let conflict = engine.resolve_conflict(id, resolution, merged).await?;

    println!(
        "Resolved {}/{} with the {} value",
        conflict.resource_type, conflict.resource_id, resolution
    );
    Ok(())
}
