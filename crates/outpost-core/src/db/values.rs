//! Small conversions between libSQL values and model fields

use libsql::{Row, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::NodeId;

pub fn optional_i64(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "column {idx}: expected integer or NULL, got {other:?}"
        ))),
    }
}

pub fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "column {idx}: expected text or NULL, got {other:?}"
        ))),
    }
}

pub fn flag(row: &Row, idx: i32) -> Result<bool> {
    Ok(row.get::<i64>(idx)? != 0)
}

pub fn uuid(row: &Row, idx: i32) -> Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|_| Error::Database(format!("invalid UUID `{raw}` in column {idx}")))
}

pub fn node_id(row: &Row, idx: i32) -> Result<NodeId> {
    uuid(row, idx).map(NodeId::from)
}

pub fn optional_node_id(row: &Row, idx: i32) -> Result<Option<NodeId>> {
    optional_text(row, idx)?
        .map(|raw| {
            raw.parse::<NodeId>()
                .map_err(|_| Error::Database(format!("invalid node id `{raw}` in column {idx}")))
        })
        .transpose()
}

pub fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

pub fn int_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}
