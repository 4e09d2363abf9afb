use std::env;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use outpost_core::db::settings_repository::keys;
use outpost_core::db::{LibSqlNodeRepository, NodeRepository};
use outpost_core::models::{FieldKind, ObjectVersion, SyncChange};
use outpost_core::sync::HttpTransport;
use outpost_core::{
    DatabaseService, EntityRecord, FieldMap, NodeRole, SchemaRegistry, SyncContext, SyncSettings,
    Value,
};
use uuid::Uuid;

use crate::cli::GlobalArgs;
use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("OUTPOST_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("outpost")
        .join("outpost.db")
}

pub fn resolve_schema_path(cli_schema: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_schema
        .or_else(|| env::var_os("OUTPOST_SCHEMA_PATH").map(PathBuf::from))
        .ok_or(CliError::SchemaNotConfigured)
}

/// Open the node database described by the global arguments.
pub async fn open_context(global: &GlobalArgs) -> Result<SyncContext, CliError> {
    let db_path = resolve_db_path(global.db_path.clone());
    let schema = SchemaRegistry::load(resolve_schema_path(global.schema.clone())?)?;
    let settings = SyncSettings::from_env()?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = DatabaseService::open_path(db_path).await?;
    context_for(db, schema, settings).await
}

/// Wrap an open database; a database that holds the server's identity keeps the server role.
pub async fn context_for(
    db: DatabaseService,
    schema: SchemaRegistry,
    settings: SyncSettings,
) -> Result<SyncContext, CliError> {
    let local = {
        let conn = db.lock().await;
        LibSqlNodeRepository::new(conn.connection()).local().await?
    };
    let role = if local.is_some_and(|node| node.is_server) {
        NodeRole::Server
    } else {
        NodeRole::Client
    };
    Ok(SyncContext::new(db, schema, settings, role))
}

/// Server URL from the flag, the environment, or the one stored at registration.
pub async fn resolve_server_url(
    cli_server_url: Option<&str>,
    ctx: &SyncContext,
) -> Result<String, CliError> {
    let explicit = cli_server_url
        .map(str::to_string)
        .or_else(|| env::var("OUTPOST_SERVER_URL").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if let Some(url) = explicit {
        return Ok(url);
    }
    ctx.db()
        .get_setting(keys::SERVER_URL)
        .await?
        .ok_or(CliError::ServerNotConfigured)
}

pub fn http_transport(url: &str, settings: &SyncSettings) -> Result<HttpTransport, CliError> {
    Ok(HttpTransport::new(url, settings.request_timeout)?)
}

pub fn parse_uuid(raw: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(raw.trim()).map_err(|_| CliError::InvalidId(raw.to_string()))
}

/// Turn `field=value` arguments into typed values using the entity's field kinds.
///
/// A single argument starting with `{` is read as a JSON object of tagged values
/// (`{"total": {"type": "real", "value": 12.5}}`). An empty value means null.
pub fn parse_fields(
    schema: &SchemaRegistry,
    entity_type: &str,
    args: &[String],
) -> Result<FieldMap, CliError> {
    let entity = schema
        .schema(entity_type)
        .ok_or_else(|| CliError::UnknownEntityType(entity_type.to_string()))?;

    if let [single] = args {
        if single.trim_start().starts_with('{') {
            return serde_json::from_str::<FieldMap>(single)
                .map_err(|error| CliError::InvalidField(single.clone(), error.to_string()));
        }
    }

    let mut fields = FieldMap::new();
    for arg in args {
        let Some((name, raw)) = arg.split_once('=') else {
            return Err(CliError::InvalidField(
                arg.clone(),
                "expected field=value".to_string(),
            ));
        };
        let name = name.trim();
        let Some(field) = entity.field(name) else {
            return Err(CliError::InvalidField(
                arg.clone(),
                format!("`{entity_type}` has no field `{name}`"),
            ));
        };
        let value = parse_value(field.kind, raw)
            .map_err(|reason| CliError::InvalidField(arg.clone(), reason))?;
        fields.insert(name.to_string(), value);
    }
    Ok(fields)
}

pub fn parse_value(kind: FieldKind, raw: &str) -> Result<Value, String> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    let trimmed = raw.trim();
    match kind {
        FieldKind::Text => Ok(Value::Text(raw.to_string())),
        FieldKind::Integer => trimmed
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| format!("`{raw}` is not an integer")),
        FieldKind::Real => trimmed
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Value::Real)
            .ok_or_else(|| format!("`{raw}` is not a finite number")),
        FieldKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("`{raw}` is not true or false")),
        },
        FieldKind::Timestamp => DateTime::parse_from_rfc3339(trimmed)
            .map(|date_time| Value::Timestamp(date_time.with_timezone(&Utc)))
            .map_err(|_| format!("`{raw}` is not an RFC 3339 timestamp")),
    }
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Text(text) => text.clone(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Timestamp(date_time) => date_time.to_rfc3339(),
    }
}

pub fn render_fields(fields: &FieldMap) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{name}={}", render_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let deleted = if record.is_deleted { "  [deleted]" } else { "" };
            format!(
                "{}  {:<10}  {}{deleted}",
                record.uuid,
                format_relative_time(record.updated_at, now_ms),
                render_fields(&record.fields)
            )
        })
        .collect()
}

pub fn format_change_lines(changes: &[SyncChange]) -> Vec<String> {
    changes
        .iter()
        .map(|change| {
            let packet = change
                .packet_no
                .map_or_else(|| "pending".to_string(), |no| format!("packet {no}"));
            format!(
                "{:>6}  {:<6}  {}/{}  to={}  {packet}",
                change.id,
                change.operation.as_str(),
                change.entity_type,
                change.entity_uuid,
                change.node_id
            )
        })
        .collect()
}

pub fn format_conflict_lines(versions: &[ObjectVersion]) -> Vec<String> {
    versions
        .iter()
        .map(|version| {
            let status = if version.is_pending_review() {
                "pending"
            } else {
                "settled"
            };
            let source = version
                .source_node_id
                .as_ref()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            format!(
                "{}  {}  {:<14}  {status:<7}  {}/{}  from={source}",
                version.id,
                format_sync_timestamp(version.arrival_time),
                version.conflict_resolution.as_str(),
                version.entity_type,
                version.entity_uuid
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_optional_timestamp(timestamp_ms: Option<i64>) -> String {
    timestamp_ms.map_or_else(|| "never".to_string(), format_sync_timestamp)
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
