use outpost_core::sync::{list_conflicts, manually_resolve_conflict};
use outpost_core::{EntityRecord, SyncContext};

use crate::cli::GlobalArgs;
use crate::commands::common::{
    format_conflict_lines, open_context, parse_fields, parse_uuid, print_json, render_fields,
};
use crate::error::CliError;

pub async fn run_conflicts_list(global: &GlobalArgs, pending_only: bool) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let versions = list_conflicts(&ctx, pending_only).await?;

    if global.json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_lines(&versions) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    global: &GlobalArgs,
    version_id: &str,
    fields: &[String],
) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let record = resolve_conflict(&ctx, version_id, fields).await?;

    if global.json {
        return print_json(&record);
    }
    println!("{}  {}", record.uuid, render_fields(&record.fields));
    Ok(())
}

/// Field arguments are typed against the entity type of the archived version.
pub async fn resolve_conflict(
    ctx: &SyncContext,
    version_id: &str,
    fields: &[String],
) -> Result<EntityRecord, CliError> {
    let id = parse_uuid(version_id)?;
    let version = list_conflicts(ctx, false)
        .await?
        .into_iter()
        .find(|version| version.id == id)
        .ok_or_else(|| CliError::ConflictNotFound(version_id.to_string()))?;
    let resolution = parse_fields(ctx.schema(), &version.entity_type, fields)?;
    Ok(manually_resolve_conflict(ctx, &id, resolution).await?)
}
