//! Contracts of the external collaborators this engine talks to.
//!
//! - [`ExecutionEngine`]: performs real database I/O (fetch, insert, wipe, discover)
//! - [`UnifiedModelService`]: scores schema similarity and converts schemas across engines
//! - [`TransformationRegistry`]: describes and executes named transformations
//! - [`MeshTransport`]: propagates entity mutations to peer nodes
//!
//! Every method is a network round trip; none of them is retried here.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::cardinality::TransformationType;
use super::filter::MappingFilter;
use super::model::{DatabaseRecord, ResourceContainer, ResourceItem, Scope};
use super::schema::SchemaModel;
use crate::error::Result;

/// A single row keyed by column name.
pub type Row = Map<String, Value>;

/// A batch of rows delivered by a streamed fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Server-streamed fetch. The stream ending (`None`) is the end-of-data signal.
pub type RowStream = BoxStream<'static, Result<RowBatch>>;

/// Options for fetching rows from a table.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Columns to read. Empty reads all columns.
    pub columns: Vec<String>,
    /// Rows per streamed batch.
    pub batch_size: usize,
    /// Mapping filters the engine applies at the source, in order.
    pub filters: Vec<MappingFilter>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            batch_size: 1_000,
            filters: Vec::new(),
        }
    }
}

/// Result of a discovery refresh on a database.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredSchema {
    pub repo_id: Option<String>,
    pub branch_id: Option<String>,
    pub commit_id: Option<String>,
    pub schema: SchemaModel,
    /// Containers and their items, ready to be addressed by rules.
    pub containers: Vec<(ResourceContainer, Vec<ResourceItem>)>,
}

/// Request to create a new database on an instance.
#[derive(Debug, Clone)]
pub struct NewDatabase {
    pub instance_id: String,
    pub name: String,
    pub engine: String,
}

/// Database execution engine ("anchor service").
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Fetch all matching rows in one call.
    async fn fetch_rows(&self, database_id: &str, table: &str, opts: FetchOptions)
        -> Result<Vec<Row>>;

    /// Start a server-streamed fetch.
    async fn stream_rows(&self, database_id: &str, table: &str, opts: FetchOptions)
        -> Result<RowStream>;

    /// Insert rows, optionally inside a single transaction. Returns rows inserted.
    async fn insert_rows(
        &self,
        database_id: &str,
        table: &str,
        rows: Vec<Row>,
        transactional: bool,
    ) -> Result<u64>;

    /// Delete every row of a table.
    async fn wipe_table(&self, database_id: &str, table: &str) -> Result<()>;

    /// Drop every object of a database.
    async fn wipe_database(&self, database_id: &str) -> Result<()>;

    /// Live schema fetched from the database, bypassing any cache.
    async fn fetch_schema(&self, database_id: &str) -> Result<SchemaModel>;

    /// Create the tables and types of `schema` in a database.
    async fn deploy_schema(&self, database_id: &str, schema: &SchemaModel) -> Result<()>;

    /// Re-run schema discovery so new objects become addressable.
    async fn refresh_discovery(&self, database_id: &str) -> Result<DiscoveredSchema>;

    async fn row_count(&self, database_id: &str, table: &str) -> Result<i64>;

    async fn create_database(&self, scope: &Scope, request: NewDatabase)
        -> Result<DatabaseRecord>;
}

/// Weighted scoring configuration sent with a match request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOptions {
    pub name_weight: f64,
    pub type_weight: f64,
    pub classification_weight: f64,
    pub privileged_data_weight: f64,
    pub structure_weight: f64,
    /// Minimum score for a column match to become a rule.
    pub acceptance_threshold: f64,
    /// Scores below this are flagged as poor by the matcher.
    pub poor_match_threshold: f64,
}

/// Per-column enrichment sent to the matcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnEnrichment {
    pub classification: Option<String>,
    pub privileged: bool,
    pub privileged_category: Option<String>,
    pub confidence: Option<f64>,
}

/// Per-table enrichment sent to the matcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableEnrichment {
    pub classification: Option<String>,
    pub estimated_rows: Option<i64>,
    pub columns: HashMap<String, ColumnEnrichment>,
}

/// A schema model with optional enrichment keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedSchema {
    pub schema: SchemaModel,
    pub enrichment: HashMap<String, TableEnrichment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub source: EnrichedSchema,
    pub target: EnrichedSchema,
    pub options: MatchOptions,
}

/// Score of one source column against one target column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMatch {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub score: f64,
    pub type_compatible: bool,
    pub is_poor_match: bool,
    pub is_unmatched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMatch {
    pub source_table: String,
    pub target_table: String,
    pub score: f64,
    pub column_matches: Vec<ColumnMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub table_matches: Vec<TableMatch>,
    pub overall_similarity: f64,
}

/// Schema matcher and converter ("unified-model service").
#[async_trait]
pub trait UnifiedModelService: Send + Sync {
    async fn match_schemas(&self, request: MatchRequest) -> Result<MatchResult>;

    /// Convert a schema between engine types. Returns the converted model as JSON.
    async fn convert_schema(
        &self,
        source_engine: &str,
        target_engine: &str,
        schema: &SchemaModel,
    ) -> Result<String>;
}

/// Description of a named transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationInfo {
    pub name: String,
    pub kind: TransformationType,
    pub valid: bool,
}

/// Named transformation registry and executor.
#[async_trait]
pub trait TransformationRegistry: Send + Sync {
    /// Look up a transformation. `None` when the name is not registered.
    async fn describe(&self, name: &str) -> Result<Option<TransformationInfo>>;

    /// Apply a transformation to a batch.
    ///
    /// `inputs[i]` holds row `i`'s source values in rule order; the result must
    /// hold one output vector per input row with one value per target item.
    async fn apply(
        &self,
        name: &str,
        options: &BTreeMap<String, String>,
        inputs: Vec<Vec<Value>>,
    ) -> Result<Vec<Vec<Value>>>;
}

/// Operation carried by a mesh broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastOperation {
    Insert,
    Update,
    Delete,
}

/// A mutation propagated to peer nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub table: String,
    pub operation: BroadcastOperation,
    pub record: Value,
    pub primary_key: String,
}

/// Inter-node mesh transport.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Single-node deployments return `false` and are never asked to send.
    fn should_broadcast(&self) -> bool;

    async fn send(&self, message: BroadcastMessage) -> Result<()>;
}
