//! Watch command implementation.

use super::Context;
use fhirsync_engine::{SyncConfig, SyncOptions, SyncStatus};
use std::path::Path;
use tracing::{info, warn};

/// Runs background sync over a bundle directory until Ctrl-C.
///
/// A pass runs right away when one is due.
pub async fn run(
    ctx: &Context,
    bundles: &Path,
    interval_minutes: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::default()
        .with_sync_interval_minutes(interval_minutes.max(1))
        .with_background_sync(true);
    let engine = ctx.open(config, Some(bundles))?.engine;

    let _subscription = engine.on_status_change(|info| match info.status {
        SyncStatus::Completed => info!(
            new_records = info.new_records.unwrap_or(0),
            "{}", info.message
        ),
        SyncStatus::Failed => warn!(
            error = info.error.as_deref().unwrap_or("-"),
            "{}", info.message
        ),
        _ => {}
    });

    engine.initialize().await?;
    if let Some(state) = engine.sync_state() {
        engine.set_conflict_policy(state.conflict_resolution);
    }

    let need = engine.is_sync_needed();
    if need.needed {
        info!(reason = %need.reason, "running initial sync");
        engine.sync(SyncOptions::default()).await;
    }

    println!(
        "Watching {} every {} minute(s); press Ctrl-C to stop",
        bundles.display(),
        interval_minutes.max(1)
    );
    tokio::signal::ctrl_c().await?;

    engine.stop_background_sync();
    println!("Stopped");
    Ok(())
}
