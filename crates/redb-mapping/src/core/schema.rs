//! Schema model exchanged with the execution engine and the unified-model service.
//!
//! A [`SchemaModel`] is a database-agnostic description of tables and the
//! user-defined types (enums, composites, domains) their columns may use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MappingError, Result};

/// A whole (or filtered) database schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub types: Vec<UserType>,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Namespace (schema) name, if the engine has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Table name.
    pub name: String,

    /// Column definitions.
    pub columns: Vec<ColumnSchema>,

    /// Primary key column names.
    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Approximate row count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<i64>,
}

impl TableSchema {
    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Engine-native type name.
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A user-defined type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// `enum`, `composite`, `domain`, ...
    pub kind: String,
    /// Engine-specific definition (enum labels, composite fields, ...).
    #[serde(default)]
    pub definition: Value,
}

impl UserType {
    /// Whether a column type refers to this type, directly or schema-qualified.
    pub fn is_referenced_by(&self, data_type: &str) -> bool {
        let ty = strip_type_decorations(data_type);
        if ty.eq_ignore_ascii_case(&self.name) {
            return true;
        }
        match (&self.namespace, ty.split_once('.')) {
            (Some(ns), Some((col_ns, col_ty))) => {
                strip_quotes(col_ns).eq_ignore_ascii_case(ns)
                    && strip_quotes(col_ty).eq_ignore_ascii_case(&self.name)
            }
            (None, Some((_, col_ty))) => strip_quotes(col_ty).eq_ignore_ascii_case(&self.name),
            _ => false,
        }
    }
}

/// Drop array brackets and type modifiers: `status[]` / `"ns"."t"(10)` -> base name.
fn strip_type_decorations(data_type: &str) -> &str {
    let ty = data_type.trim();
    let ty = ty.split('(').next().unwrap_or(ty);
    let ty = ty.trim_end_matches("[]").trim();
    strip_quotes(ty)
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches('"')
}

impl SchemaModel {
    pub fn find_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name == name || t.full_name() == name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.find_table(name).is_some()
    }

    /// Reduce the model to one table, keeping every user-defined type.
    ///
    /// Used before per-table matching so that other tables cannot pollute the
    /// result.
    pub fn filter_to_table(&self, name: &str) -> Result<SchemaModel> {
        let table = self
            .find_table(name)
            .ok_or_else(|| MappingError::not_found("table", name))?;
        Ok(SchemaModel {
            tables: vec![table.clone()],
            types: self.types.clone(),
        })
    }

    /// Types referenced by any column of `table`.
    pub fn referenced_types(&self, table: &TableSchema) -> Vec<UserType> {
        self.types
            .iter()
            .filter(|ty| {
                table
                    .columns
                    .iter()
                    .any(|col| ty.is_referenced_by(&col.data_type))
            })
            .cloned()
            .collect()
    }

    /// Extract one table plus exactly the user-defined types it references.
    pub fn extract_table(&self, name: &str) -> Result<SchemaModel> {
        let table = self
            .find_table(name)
            .ok_or_else(|| MappingError::not_found("table", name))?;
        Ok(SchemaModel {
            types: self.referenced_types(table),
            tables: vec![table.clone()],
        })
    }

    /// Rename the single table of an extracted model.
    pub fn rename_table(&mut self, from: &str, to: &str) -> Result<()> {
        let table = self
            .tables
            .iter_mut()
            .find(|t| t.name == from || t.full_name() == from)
            .ok_or_else(|| MappingError::not_found("table", from))?;
        table.name = to.to_string();
        Ok(())
    }

    /// Parse a model returned as JSON by a collaborator.
    pub fn from_json(json: &str) -> Result<SchemaModel> {
        serde_json::from_str(json).map_err(|e| {
            MappingError::internal(format!("failed to parse converted schema: {}", e))
        })
    }
}
