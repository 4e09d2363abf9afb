use outpost_core::{EntityRecord, RecordService, SyncContext};

use crate::cli::{GlobalArgs, RecordCommands};
use crate::commands::common::{
    format_record_lines, open_context, parse_fields, parse_uuid, print_json,
};
use crate::error::CliError;

#[derive(Debug)]
pub enum RecordOutput {
    One(EntityRecord),
    Many(Vec<EntityRecord>),
}

pub async fn run_record(global: &GlobalArgs, command: &RecordCommands) -> Result<(), CliError> {
    let ctx = open_context(global).await?;
    let output = execute_record(&ctx, command).await?;

    match (output, global.json) {
        (RecordOutput::One(record), true) => print_json(&record)?,
        (RecordOutput::Many(records), true) => print_json(&records)?,
        (RecordOutput::One(record), false) => {
            for line in format_record_lines(std::slice::from_ref(&record)) {
                println!("{line}");
            }
        }
        (RecordOutput::Many(records), false) => {
            if records.is_empty() {
                println!("No records.");
            }
            for line in format_record_lines(&records) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Every write goes through the record service, so each one is queued for sync.
pub async fn execute_record(
    ctx: &SyncContext,
    command: &RecordCommands,
) -> Result<RecordOutput, CliError> {
    let records = RecordService::new(ctx.clone());

    let record = match command {
        RecordCommands::Put {
            entity_type,
            fields,
        } => {
            let fields = parse_fields(ctx.schema(), entity_type, fields)?;
            records.create(entity_type, fields).await?
        }
        RecordCommands::Update {
            entity_type,
            uuid,
            fields,
        } => {
            let uuid = parse_uuid(uuid)?;
            let fields = parse_fields(ctx.schema(), entity_type, fields)?;
            records.update(entity_type, &uuid, fields).await?
        }
        RecordCommands::Delete { entity_type, uuid } => {
            records.delete(entity_type, &parse_uuid(uuid)?).await?
        }
        RecordCommands::Undelete { entity_type, uuid } => {
            records.undelete(entity_type, &parse_uuid(uuid)?).await?
        }
        RecordCommands::Show { entity_type, uuid } => records
            .get(entity_type, &parse_uuid(uuid)?)
            .await?
            .ok_or_else(|| CliError::RecordNotFound(format!("{entity_type}/{uuid}")))?,
        RecordCommands::List {
            entity_type,
            deleted,
        } => return Ok(RecordOutput::Many(records.list(entity_type, *deleted).await?)),
    };
    Ok(RecordOutput::One(record))
}
