//! Invalidate command implementation.

use super::Context;
use fhirsync_engine::SyncConfig;

/// Forgets the last checkpoint so the next sync is a full refresh.
///
/// Stored records, queued local edits and pending conflicts are kept.
pub async fn run(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let engine = ctx.open(SyncConfig::default(), None)?.engine;
    engine.initialize().await?;
    engine.invalidate_cache().await?;
    println!(
        "Sync cache invalidated for {}; the next sync will be a full refresh",
        ctx.connection
    );
    Ok(())
}
