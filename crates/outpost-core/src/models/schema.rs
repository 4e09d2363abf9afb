//! Entity field schemas and the schema-version compatibility marker

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{FieldMap, Value};
use crate::error::{Error, Result};

/// Declared type of an entity field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    Bool,
    Timestamp,
}

impl FieldKind {
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Text, Value::Text(_))
                | (Self::Integer, Value::Integer(_))
                | (Self::Real, Value::Real(_) | Value::Integer(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
        }
    }
}

const fn default_true() -> bool {
    true
}

/// One declared field of an entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Local-only fields (UI state and the like) set this to false
    #[serde(default = "default_true")]
    pub synced: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

/// Field schema of one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySchema {
    pub entity_type: String,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    version: u32,
    #[serde(default)]
    min_compatible_version: Option<u32>,
    entities: Vec<EntitySchema>,
}

/// All entity types this node can synchronize, plus the schema version it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistry {
    version: u32,
    min_compatible_version: u32,
    entities: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Registry accepting exactly `version` from peers.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            min_compatible_version: version,
            entities: HashMap::new(),
        }
    }

    /// Accept peers advertising any version in `min_compatible_version..=version`.
    #[must_use]
    pub fn with_min_compatible(mut self, min_compatible_version: u32) -> Self {
        self.min_compatible_version = min_compatible_version.min(self.version);
        self
    }

    /// Register an entity type; later registrations replace earlier ones.
    pub fn register(&mut self, schema: EntitySchema) -> Result<()> {
        let entity_type = schema.entity_type.trim();
        if entity_type.is_empty() {
            return Err(Error::InvalidInput("entity_type must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &schema.fields {
            if field.name.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "entity type `{entity_type}` declares a field with an empty name"
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "entity type `{entity_type}` declares field `{}` twice",
                    field.name
                )));
            }
        }
        self.entities.insert(entity_type.to_string(), schema);
        Ok(())
    }

    /// Parse a JSON schema file
    pub fn from_json_str(payload: &str) -> Result<Self> {
        let file: SchemaFile = serde_json::from_str(payload)?;
        let min = file.min_compatible_version.unwrap_or(file.version);
        if min > file.version {
            return Err(Error::InvalidInput(format!(
                "min_compatible_version {min} is greater than version {}",
                file.version
            )));
        }
        let mut registry = Self::new(file.version).with_min_compatible(min);
        for schema in file.entities {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    /// Load a JSON schema file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&payload)
    }

    pub const fn version(&self) -> u32 {
        self.version
    }

    pub const fn min_compatible_version(&self) -> u32 {
        self.min_compatible_version
    }

    /// Whether a peer advertising `version` may exchange packets with us
    pub const fn is_compatible(&self, version: u32) -> bool {
        version >= self.min_compatible_version && version <= self.version
    }

    /// Fail with `SchemaIncompatible` unless `version` is accepted
    pub fn check_compatible(&self, version: u32) -> Result<()> {
        if self.is_compatible(version) {
            Ok(())
        } else {
            Err(Error::SchemaIncompatible {
                local: self.version,
                min_compatible: self.min_compatible_version,
                remote: version,
            })
        }
    }

    pub fn schema(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.entities.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Validate a set of local field values (synced and local-only) for a write.
    pub fn validate_local(&self, entity_type: &str, fields: &FieldMap) -> Result<()> {
        self.validate(entity_type, fields, false)
    }

    /// Validate field values received from a peer; local-only fields are not allowed.
    pub fn validate_incoming(&self, entity_type: &str, fields: &FieldMap) -> Result<()> {
        self.validate(entity_type, fields, true)
    }

    fn validate(&self, entity_type: &str, fields: &FieldMap, synced_only: bool) -> Result<()> {
        let schema = self.schema(entity_type).ok_or_else(|| {
            Error::InvalidInput(format!("unknown entity type `{entity_type}`"))
        })?;

        for (name, value) in fields {
            let field = schema.field(name).ok_or_else(|| {
                Error::InvalidInput(format!("`{entity_type}` has no field `{name}`"))
            })?;
            if synced_only && !field.synced {
                return Err(Error::InvalidInput(format!(
                    "`{entity_type}.{name}` is local-only and cannot be synchronized"
                )));
            }
            if !field.kind.accepts(value) {
                return Err(Error::InvalidInput(format!(
                    "`{entity_type}.{name}` expects {}, got {}",
                    field.kind.as_str(),
                    value.kind_name()
                )));
            }
            if value.is_null() && !field.nullable {
                return Err(Error::InvalidInput(format!(
                    "`{entity_type}.{name}` must not be null"
                )));
            }
            if let Value::Real(real) = value {
                if !real.is_finite() {
                    return Err(Error::InvalidInput(format!(
                        "`{entity_type}.{name}` must be a finite number"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Keep only the synchronizable fields of `fields`.
    pub fn synced_fields(&self, entity_type: &str, fields: &FieldMap) -> Result<FieldMap> {
        let schema = self.schema(entity_type).ok_or_else(|| {
            Error::InvalidInput(format!("unknown entity type `{entity_type}`"))
        })?;
        Ok(fields
            .iter()
            .filter(|(name, _)| schema.field(name).is_some_and(|field| field.synced))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "version": 3,
        "min_compatible_version": 2,
        "entities": [
            {
                "entity_type": "estimate",
                "fields": [
                    {"name": "title", "kind": "text", "nullable": false},
                    {"name": "amount", "kind": "real"},
                    {"name": "approved", "kind": "bool"},
                    {"name": "panel_open", "kind": "bool", "synced": false}
                ]
            }
        ]
    }"#;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn parses_schema_file() {
        let registry = SchemaRegistry::from_json_str(SCHEMA).unwrap();
        assert_eq!(registry.version(), 3);
        assert_eq!(registry.min_compatible_version(), 2);
        assert!(registry.schema("estimate").is_some());
        assert!(registry.schema("timesheet").is_none());
    }

    #[test]
    fn compatibility_is_a_closed_range() {
        let registry = SchemaRegistry::from_json_str(SCHEMA).unwrap();
        assert!(!registry.is_compatible(1));
        assert!(registry.is_compatible(2));
        assert!(registry.is_compatible(3));
        assert!(!registry.is_compatible(4));
        assert!(matches!(
            registry.check_compatible(1),
            Err(Error::SchemaIncompatible { remote: 1, .. })
        ));
    }

    #[test]
    fn rejects_min_above_version() {
        let payload = r#"{"version": 1, "min_compatible_version": 2, "entities": []}"#;
        assert!(SchemaRegistry::from_json_str(payload).is_err());
    }

    #[test]
    fn rejects_duplicate_field_names() {
        let mut registry = SchemaRegistry::new(1);
        let schema = EntitySchema {
            entity_type: "x".to_string(),
            fields: vec![
                FieldDef {
                    name: "a".to_string(),
                    kind: FieldKind::Text,
                    synced: true,
                    nullable: true,
                },
                FieldDef {
                    name: "a".to_string(),
                    kind: FieldKind::Integer,
                    synced: true,
                    nullable: true,
                },
            ],
        };
        assert!(registry.register(schema).is_err());
    }

    #[test]
    fn validates_field_types() {
        let registry = SchemaRegistry::from_json_str(SCHEMA).unwrap();
        let good = fields(&[
            ("title", Value::from("Roof")),
            ("amount", Value::Integer(12)),
            ("panel_open", Value::Bool(true)),
        ]);
        assert!(registry.validate_local("estimate", &good).is_ok());

        let bad = fields(&[("title", Value::Integer(1))]);
        let err = registry.validate_local("estimate", &bad).unwrap_err();
        assert!(err.to_string().contains("expects text"));

        let unknown = fields(&[("colour", Value::from("red"))]);
        assert!(registry.validate_local("estimate", &unknown).is_err());

        let null_title = fields(&[("title", Value::Null)]);
        assert!(registry.validate_local("estimate", &null_title).is_err());

        let nan = fields(&[("amount", Value::Real(f64::NAN))]);
        assert!(registry.validate_local("estimate", &nan).is_err());
    }

    #[test]
    fn incoming_data_cannot_carry_local_fields() {
        let registry = SchemaRegistry::from_json_str(SCHEMA).unwrap();
        let incoming = fields(&[("panel_open", Value::Bool(true))]);
        assert!(registry.validate_incoming("estimate", &incoming).is_err());
    }

    #[test]
    fn synced_fields_drop_local_state() {
        let registry = SchemaRegistry::from_json_str(SCHEMA).unwrap();
        let all = fields(&[
            ("title", Value::from("Roof")),
            ("panel_open", Value::Bool(true)),
        ]);
        let synced = registry.synced_fields("estimate", &all).unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced.contains_key("title"));
    }
}
