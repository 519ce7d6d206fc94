//! Conflicts command implementation.

use super::{is_json, Context};
use fhirsync_engine::SyncConfig;
use fhirsync_model::SyncConflict;

/// Lists the conflicts waiting for manual resolution.
pub async fn run(ctx: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let engine = ctx.open(SyncConfig::default(), None)?.engine;
    engine.initialize().await?;
    let conflicts = engine.get_pending_conflicts();

    if is_json(format) {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
    } else {
        print_text_output(&conflicts);
    }
    Ok(())
}

fn print_text_output(conflicts: &[SyncConflict]) {
    if conflicts.is_empty() {
        println!("No pending conflicts");
        return;
    }

    println!("{} pending conflict(s):", conflicts.len());
    for conflict in conflicts {
        let server = conflict.server_value.to_fields();
        let local = conflict.local_value.to_fields();
        println!();
        println!("  {}", conflict.id);
        println!(
            "    Resource: {}/{}",
            conflict.resource_type, conflict.resource_id
        );
        println!("    Detected: {}", conflict.detected_at.to_rfc3339());
        println!("    Field:    {}", conflict.field);
        println!("    Server:   {}", server[conflict.field.as_str()]);
        println!("    Local:    {}", local[conflict.field.as_str()]);
    }
}
