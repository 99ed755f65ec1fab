//! Persistent data model: mappings, rules, resource containers and items.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::address::{ObjectType, ResourceAddress};
use super::cardinality::Cardinality;
use super::schema::SchemaModel;
use crate::error::{MappingError, Result};

/// Name of the built-in column copy transformation.
pub const DIRECT_MAPPING: &str = "direct_mapping";

/// Tenant and workspace every entity is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub workspace_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: workspace_id.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.workspace_id)
    }
}

/// Type tag of a mapping endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Database,
    Table,
    Stream,
    McpResource,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Table => "table",
            ResourceKind::Stream => "stream",
            ResourceKind::McpResource => "mcp-resource",
        }
    }

    /// Kind of a mapping endpoint address. Columns cannot be endpoints.
    pub fn of(address: &ResourceAddress) -> Result<Self> {
        match address.object_type() {
            ObjectType::Database => Ok(ResourceKind::Database),
            ObjectType::Table => Ok(ResourceKind::Table),
            ObjectType::StreamTopic => Ok(ResourceKind::Stream),
            ObjectType::McpResource => Ok(ResourceKind::McpResource),
            ObjectType::Column => Err(MappingError::invalid(format!(
                "'{}' is a column address; mappings connect databases, tables, streams or MCP resources",
                address
            ))),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "database" => Ok(ResourceKind::Database),
            "table" => Ok(ResourceKind::Table),
            "stream" => Ok(ResourceKind::Stream),
            "mcp-resource" => Ok(ResourceKind::McpResource),
            other => Err(MappingError::invalid(format!(
                "unknown resource type '{}': expected database, table, stream or mcp-resource",
                other
            ))),
        }
    }
}

/// Validation outcome persisted on a mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationState {
    pub validated: bool,
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A declared correspondence between a source and a target resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub scope: Scope,
    pub name: String,
    pub description: String,
    pub source_kind: ResourceKind,
    pub target_kind: ResourceKind,
    pub source: ResourceAddress,
    pub target: ResourceAddress,
    pub source_container_id: Option<String>,
    pub target_container_id: Option<String>,
    /// Human-readable provenance (database names, table names, generator).
    #[serde(default)]
    pub provenance: Map<String, Value>,
    #[serde(default)]
    pub validation: ValidationState,
    /// Denormalized count of attached rules.
    pub rule_count: usize,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mapping {
    /// `"{source_type}-to-{target_type}"`.
    pub fn mapping_type(&self) -> String {
        format!("{}-to-{}", self.source_kind, self.target_kind)
    }

    pub fn is_validated(&self) -> bool {
        self.validation.validated
    }

    /// Reset the validity flag after an attached rule changed.
    pub fn invalidate(&mut self) {
        self.validation.validated = false;
        self.updated_at = Utc::now();
    }
}

/// How a rule came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    AutoGenerated,
    #[default]
    UserDefined,
}

/// Rule metadata: known provenance fields plus an open bag for anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMetadata {
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_compatible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_method: Option<String>,
    /// Keys this engine does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RuleMetadata {
    /// Split a loose key/value map into known fields and the extra bag.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map)).map_err(|e| {
            MappingError::invalid(format!("invalid rule metadata: {}", e))
        })
    }
}

/// One transformation edge between source and target items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub scope: Scope,
    pub name: String,
    pub description: String,
    pub cardinality: Cardinality,
    pub source_items: Vec<ResourceAddress>,
    pub target_items: Vec<ResourceAddress>,
    pub transformation: String,
    /// Opaque options passed through to the transformation.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: RuleMetadata,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn is_direct(&self) -> bool {
        self.transformation == DIRECT_MAPPING
    }
}

/// A rule attached to a mapping at a given position.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedRule {
    pub order: i32,
    pub rule: Rule,
}

/// Owning grouping of resource items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Table,
    StreamTopic,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Table => "table",
            ContainerKind::StreamTopic => "stream_topic",
        }
    }
}

impl FromStr for ContainerKind {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(ContainerKind::Table),
            "stream_topic" => Ok(ContainerKind::StreamTopic),
            other => Err(MappingError::internal(format!(
                "unknown container kind '{}'",
                other
            ))),
        }
    }
}

/// A table or stream topic discovered in a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContainer {
    pub id: String,
    pub database_id: String,
    pub kind: ContainerKind,
    pub name: String,
    pub address: ResourceAddress,
    pub estimated_rows: Option<i64>,
}

/// Privileged-data classification of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivilegedData {
    /// Category such as `email`, `phone`, `national_id`.
    pub category: String,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f64,
}

/// An addressable column with discovered metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceItem {
    pub id: String,
    pub container_id: String,
    pub name: String,
    pub address: ResourceAddress,
    pub data_type: String,
    pub unified_type: Option<String>,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub is_indexed: bool,
    pub classification: Option<String>,
    pub privileged: Option<PrivilegedData>,
}

/// A connected (or registered) database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub id: String,
    pub scope: Scope,
    pub name: String,
    /// Engine type, e.g. `postgres`, `mysql`, `mssql`.
    pub engine: String,
    pub connected: bool,
    pub instance_id: Option<String>,
    /// Last discovered schema, if discovery has run.
    pub schema: Option<SchemaModel>,
}

impl DatabaseRecord {
    pub fn require_connected(&self, role: &str) -> Result<()> {
        if !self.connected {
            return Err(MappingError::precondition(format!(
                "{} database '{}' ({}) is not connected",
                role, self.name, self.id
            )));
        }
        Ok(())
    }

    pub fn require_schema(&self) -> Result<&SchemaModel> {
        self.schema.as_ref().ok_or_else(|| {
            MappingError::precondition(format!(
                "database '{}' ({}) has no discovered schema",
                self.name, self.id
            ))
        })
    }
}

/// Schema stored for a repository commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSchema {
    pub repo: String,
    pub branch: String,
    pub commit: String,
    pub engine: String,
    pub schema: SchemaModel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_kind_of_address() {
        assert_eq!(
            ResourceKind::of(&ResourceAddress::database("db1")).unwrap(),
            ResourceKind::Database
        );
        assert_eq!(
            ResourceKind::of(&ResourceAddress::mcp("tool")).unwrap(),
            ResourceKind::McpResource
        );
        assert!(ResourceKind::of(&ResourceAddress::column("db1", "t", "c")).is_err());
    }

    #[test]
    fn test_rule_metadata_keeps_unknown_keys() {
        let map = json!({
            "provenance": "auto_generated",
            "match_score": 0.92,
            "source_table": "users",
            "reviewed_by": "ops"
        })
        .as_object()
        .cloned()
        .unwrap();

        let meta = RuleMetadata::from_map(map).unwrap();
        assert_eq!(meta.provenance, Provenance::AutoGenerated);
        assert_eq!(meta.match_score, Some(0.92));
        assert_eq!(meta.source_table.as_deref(), Some("users"));
        assert_eq!(meta.extra.get("reviewed_by"), Some(&json!("ops")));

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["reviewed_by"], json!("ops"));
        assert_eq!(back["provenance"], json!("auto_generated"));
    }

    #[test]
    fn test_rule_metadata_rejects_bad_known_field() {
        let map = json!({"match_score": "high"}).as_object().cloned().unwrap();
        assert!(RuleMetadata::from_map(map).is_err());
    }

    #[test]
    fn test_database_requires_connection() {
        let db = DatabaseRecord {
            id: "db1".into(),
            scope: Scope::new("t", "w"),
            name: "orders".into(),
            engine: "postgres".into(),
            connected: false,
            instance_id: None,
            schema: None,
        };
        let err = db.require_connected("source").unwrap_err();
        assert_eq!(err.code(), crate::error::StatusCode::FailedPrecondition);
        assert!(db.require_schema().is_err());
    }
}
