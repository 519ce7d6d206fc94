//! Status command implementation.

use super::{is_json, Context};
use chrono::{DateTime, Utc};
use fhirsync_engine::{SyncConfig, SyncNeedReason};
use fhirsync_model::{Collection, ConflictPolicy, ResourceType};
use serde::Serialize;
use std::collections::BTreeMap;

/// Sync status of one connection.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Connection ID.
    pub connection: String,
    /// Whether a pass has ever succeeded.
    pub synced: bool,
    /// Last successful checkpoint.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// When the next pass is due.
    pub next_sync_at: Option<DateTime<Utc>>,
    /// Whether a pass is due now.
    pub sync_needed: bool,
    /// Why a pass is or is not due.
    pub reason: SyncNeedReason,
    /// Policy stored with the last checkpoint.
    pub conflict_resolution: ConflictPolicy,
    /// Number of conflicts waiting for resolution.
    pub pending_conflicts: usize,
    /// Number of queued local edits.
    pub pending_changes: usize,
    /// Per-type watermarks.
    pub watermarks: BTreeMap<ResourceType, DateTime<Utc>>,
    /// Stored record counts per collection.
    pub records: BTreeMap<Collection, usize>,
}

/// Runs the status command.
pub async fn run(ctx: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = ctx.open(SyncConfig::default(), None)?;
    let engine = session.engine;
    engine.initialize().await?;
    let state = engine.sync_state().ok_or("No sync state loaded")?;
    let info = engine.status();
    let need = engine.is_sync_needed();

    let records = Collection::ALL
        .into_iter()
        .map(|collection| (collection, session.store.count(collection)))
        .collect();

    let report = StatusReport {
        connection: state.connection_id.clone(),
        synced: !state.never_synced(),
        last_successful_sync_at: state.last_successful_sync_at,
        next_sync_at: info.next_sync_at,
        sync_needed: need.needed,
        reason: need.reason,
        conflict_resolution: state.conflict_resolution,
        pending_conflicts: state.unresolved_conflicts.len(),
        pending_changes: state.pending_changes.len(),
        watermarks: state.resource_timestamps.clone(),
        records,
    };

    if is_json(format) {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text_output(&report);
    }
    Ok(())
}

fn print_text_output(report: &StatusReport) {
    println!("Connection: {}", report.connection);
    println!();
    match report.last_successful_sync_at {
        Some(at) => println!("  Last sync:         {}", at.to_rfc3339()),
        None => println!("  Last sync:         never"),
    }
    if let Some(at) = report.next_sync_at {
        println!("  Next sync due:     {}", at.to_rfc3339());
    }
    println!(
        "  Sync needed:       {} ({})",
        if report.sync_needed { "yes" } else { "no" },
        report.reason
    );
    println!("  Conflict policy:   {}", report.conflict_resolution);
    println!("  Pending conflicts: {}", report.pending_conflicts);
    println!("  Pending changes:   {}", report.pending_changes);

    println!();
    println!("Records:");
    for (collection, count) in &report.records {
        println!("  {:<15} {count}", collection.as_str());
    }

    if !report.watermarks.is_empty() {
        println!();
        println!("Watermarks:");
        for (resource_type, at) in &report.watermarks {
            println!("  {:<20} {}", resource_type.as_str(), at.to_rfc3339());
        }
    }
}
