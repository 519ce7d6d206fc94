//! Sync command implementation.

use super::{is_json, Context};
use fhirsync_engine::{SyncConfig, SyncOptions, SyncResult};
use fhirsync_model::ConflictPolicy;
use std::path::Path;

/// Runs one sync pass over a bundle directory.
///
/// Without `--policy` the policy stored with the previous checkpoint is
/// kept.
pub async fn run(
    ctx: &Context,
    bundles: &Path,
    full_refresh: bool,
    policy: Option<ConflictPolicy>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = ctx.open(SyncConfig::default(), Some(bundles))?.engine;
    engine.initialize().await?;
    match (policy, engine.sync_state()) {
        (Some(policy), _) => engine.set_conflict_policy(policy),
        (None, Some(state)) => engine.set_conflict_policy(state.conflict_resolution),
        (None, None) => {}
    }

    let options = if full_refresh {
        SyncOptions::full_refresh()
    } else {
        SyncOptions::default()
    };
    let result = engine.sync(options).await;

    if is_json(format) {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text_output(&result);
    }

    if result.success {
        Ok(())
    } else {
        Err("Sync failed".into())
    }
}

fn print_text_output(result: &SyncResult) {
    let kind = if result.full_refresh {
        "full refresh"
    } else {
        "incremental"
    };
    if result.success {
        println!("Sync completed ({kind}) in {:?}", result.duration);
    } else {
        println!("Sync failed ({kind}) after {:?}", result.duration);
    }

    if !result.items_synced.is_empty() {
        println!();
        println!("Fetched:");
        for (resource_type, count) in &result.items_synced {
            println!("  {:<20} {count}", resource_type.as_str());
        }
    }

    println!();
    println!("  New or updated:  {}", result.new_data.len());
    println!(
        "  Conflicts:       {} ({} unresolved)",
        result.conflicts.len(),
        result.unresolved_conflicts().count()
    );
    for conflict in result.unresolved_conflicts() {
        println!(
            "    {} {}/{} ({})",
            conflict.id, conflict.resource_type, conflict.resource_id, conflict.field
        );
    }
    println!("  Errors:          {}", result.errors.len());
    for error in &result.errors {
        println!("    {error}");
    }
    if result.success {
        println!("  Next sync due:   {}", result.next_sync_at.to_rfc3339());
    }
}
