//! In-memory collaborators and fixtures shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;

use crate::core::{
    BroadcastMessage, Cardinality, DatabaseRecord, DiscoveredSchema, ExecutionEngine,
    FetchOptions, FilterType, MatchRequest, MatchResult, Mapping, MeshTransport, NewDatabase,
    ResourceAddress, ResourceKind, Row, RowBatch, RowStream, Rule, RuleMetadata, SchemaModel,
    Scope, TransformationInfo, TransformationRegistry, TransformationType, UnifiedModelService,
    ValidationState, DIRECT_MAPPING,
};
use crate::error::{MappingError, Result};

type TableKey = (String, String);

fn key(database_id: &str, table: &str) -> TableKey {
    (database_id.to_string(), table.to_string())
}

pub fn scope() -> Scope {
    Scope::new("tenant1", "ws1")
}

/// Turn a JSON object literal into a row.
pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

pub fn database(id: &str, connected: bool) -> DatabaseRecord {
    DatabaseRecord {
        id: id.into(),
        scope: scope(),
        name: format!("{}_db", id),
        engine: "postgres".into(),
        connected,
        instance_id: None,
        schema: None,
    }
}

/// A database-to-database mapping from `src` to `dst`.
pub fn sample_mapping(id: &str, name: &str) -> Mapping {
    let now = Utc::now();
    Mapping {
        id: id.into(),
        scope: scope(),
        name: name.into(),
        description: String::new(),
        source_kind: ResourceKind::Database,
        target_kind: ResourceKind::Database,
        source: ResourceAddress::database("src"),
        target: ResourceAddress::database("dst"),
        source_container_id: None,
        target_container_id: None,
        provenance: Default::default(),
        validation: ValidationState::default(),
        rule_count: 0,
        owner_id: "user1".into(),
        created_at: now,
        updated_at: now,
    }
}

/// A one-to-one `direct_mapping` rule `src.users.id -> dst.people.id`.
pub fn sample_rule(id: &str, name: &str) -> Rule {
    let mut rule = column_rule(name, ("src", "users", "id"), &[("dst", "people", "id")]);
    rule.id = id.into();
    rule
}

/// A `direct_mapping` rule between columns. The id equals the name.
pub fn column_rule(
    name: &str,
    source: (&str, &str, &str),
    targets: &[(&str, &str, &str)],
) -> Rule {
    let source_items = vec![ResourceAddress::column(source.0, source.1, source.2)];
    let target_items: Vec<ResourceAddress> = targets
        .iter()
        .map(|(db, table, column)| ResourceAddress::column(*db, *table, *column))
        .collect();
    let now = Utc::now();
    Rule {
        id: name.into(),
        scope: scope(),
        name: name.into(),
        description: String::new(),
        cardinality: Cardinality::infer(source_items.len(), target_items.len())
            .unwrap_or(Cardinality::OneToOne),
        source_items,
        target_items,
        transformation: DIRECT_MAPPING.into(),
        options: BTreeMap::new(),
        metadata: RuleMetadata::default(),
        owner_id: "user1".into(),
        created_at: now,
        updated_at: now,
    }
}

/// Execution engine over in-memory tables.
#[derive(Default)]
pub struct MockEngine {
    tables: Mutex<HashMap<TableKey, Vec<Row>>>,
    inserted: Mutex<HashMap<TableKey, Vec<Row>>>,
    failing_inserts: Mutex<HashSet<TableKey>>,
    /// Fail only the n-th insert call (1-based) into a table.
    failing_insert_call: Mutex<HashMap<TableKey, usize>>,
    insert_calls: Mutex<HashMap<TableKey, usize>>,
    fetch_filters: Mutex<HashMap<TableKey, usize>>,
    schemas: Mutex<HashMap<String, SchemaModel>>,
    deployed: Mutex<Vec<(String, SchemaModel)>>,
    discovery: Mutex<HashMap<String, DiscoveredSchema>>,
    wiped_databases: Mutex<Vec<String>>,
    created: Mutex<Vec<NewDatabase>>,
    fail_discovery: Mutex<bool>,
    fail_deploy: Mutex<bool>,
    refreshed: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn seed(&self, database_id: &str, table: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .unwrap()
            .insert(key(database_id, table), rows);
    }

    pub fn fail_inserts_into(&self, database_id: &str, table: &str) {
        self.failing_inserts
            .lock()
            .unwrap()
            .insert(key(database_id, table));
    }

    /// Rows inserted through the engine, in insert order.
    pub fn inserted(&self, database_id: &str, table: &str) -> Vec<Row> {
        self.inserted
            .lock()
            .unwrap()
            .get(&key(database_id, table))
            .cloned()
            .unwrap_or_default()
    }

    /// Current table content.
    pub fn table(&self, database_id: &str, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(&key(database_id, table))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of filters received by the last fetch of a table.
    pub fn fetch_filters(&self, database_id: &str, table: &str) -> usize {
        self.fetch_filters
            .lock()
            .unwrap()
            .get(&key(database_id, table))
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_insert_call(&self, database_id: &str, table: &str, call: usize) {
        self.failing_insert_call
            .lock()
            .unwrap()
            .insert(key(database_id, table), call);
    }

    pub fn set_schema(&self, database_id: &str, schema: SchemaModel) {
        self.schemas
            .lock()
            .unwrap()
            .insert(database_id.into(), schema);
    }

    pub fn set_discovery(&self, database_id: &str, discovered: DiscoveredSchema) {
        self.discovery
            .lock()
            .unwrap()
            .insert(database_id.into(), discovered);
    }

    pub fn fail_discovery(&self) {
        *self.fail_discovery.lock().unwrap() = true;
    }

    pub fn fail_deploy(&self) {
        *self.fail_deploy.lock().unwrap() = true;
    }

    pub fn deployed(&self) -> Vec<(String, SchemaModel)> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn wiped_databases(&self) -> Vec<String> {
        self.wiped_databases.lock().unwrap().clone()
    }

    /// Databases a discovery refresh was requested for.
    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<NewDatabase> {
        self.created.lock().unwrap().clone()
    }

    fn read(&self, database_id: &str, table: &str, opts: &FetchOptions) -> Result<Vec<Row>> {
        let k = key(database_id, table);
        self.fetch_filters
            .lock()
            .unwrap()
            .insert(k.clone(), opts.filters.len());
        let mut rows = self
            .tables
            .lock()
            .unwrap()
            .get(&k)
            .cloned()
            .ok_or_else(|| MappingError::not_found("table", format!("{}.{}", database_id, table)))?;

        for filter in &opts.filters {
            if filter.filter_type == FilterType::Limit {
                if let Some(count) = filter.expression.get("count").and_then(Value::as_u64) {
                    rows.truncate(count as usize);
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    async fn fetch_rows(
        &self,
        database_id: &str,
        table: &str,
        opts: FetchOptions,
    ) -> Result<Vec<Row>> {
        self.read(database_id, table, &opts)
    }

    async fn stream_rows(
        &self,
        database_id: &str,
        table: &str,
        opts: FetchOptions,
    ) -> Result<RowStream> {
        let rows = self.read(database_id, table, &opts)?;
        let batches: Vec<Result<RowBatch>> = rows
            .chunks(opts.batch_size.max(1))
            .map(|chunk| Ok(RowBatch::new(chunk.to_vec())))
            .collect();
        Ok(futures::stream::iter(batches).boxed())
    }

    async fn insert_rows(
        &self,
        database_id: &str,
        table: &str,
        rows: Vec<Row>,
        _transactional: bool,
    ) -> Result<u64> {
        let k = key(database_id, table);
        let call = {
            let mut calls = self.insert_calls.lock().unwrap();
            let n = calls.entry(k.clone()).or_default();
            *n += 1;
            *n
        };
        let failing_call = self.failing_insert_call.lock().unwrap().get(&k) == Some(&call);
        if failing_call || self.failing_inserts.lock().unwrap().contains(&k) {
            return Err(MappingError::unavailable(
                "anchor",
                format!("insert into {}.{} rejected", database_id, table),
            ));
        }
        let count = rows.len() as u64;
        self.tables
            .lock()
            .unwrap()
            .entry(k.clone())
            .or_default()
            .extend(rows.iter().cloned());
        self.inserted
            .lock()
            .unwrap()
            .entry(k)
            .or_default()
            .extend(rows);
        // The rows are stored; let concurrent writers run before acknowledging.
        tokio::task::yield_now().await;
        Ok(count)
    }

    async fn wipe_table(&self, database_id: &str, table: &str) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .insert(key(database_id, table), Vec::new());
        Ok(())
    }

    async fn wipe_database(&self, database_id: &str) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .retain(|(db, _), _| db != database_id);
        self.schemas.lock().unwrap().remove(database_id);
        self.wiped_databases
            .lock()
            .unwrap()
            .push(database_id.to_string());
        Ok(())
    }

    async fn fetch_schema(&self, database_id: &str) -> Result<SchemaModel> {
        Ok(self
            .schemas
            .lock()
            .unwrap()
            .get(database_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn deploy_schema(&self, database_id: &str, schema: &SchemaModel) -> Result<()> {
        if *self.fail_deploy.lock().unwrap() {
            return Err(MappingError::unavailable("anchor", "deploy rejected"));
        }
        self.deployed
            .lock()
            .unwrap()
            .push((database_id.to_string(), schema.clone()));
        let mut schemas = self.schemas.lock().unwrap();
        let current = schemas.entry(database_id.to_string()).or_default();
        current.tables.extend(schema.tables.iter().cloned());
        current.types.extend(schema.types.iter().cloned());
        Ok(())
    }

    async fn refresh_discovery(&self, database_id: &str) -> Result<DiscoveredSchema> {
        self.refreshed.lock().unwrap().push(database_id.to_string());
        if *self.fail_discovery.lock().unwrap() {
            return Err(MappingError::unavailable("anchor", "discovery timed out"));
        }
        if let Some(found) = self.discovery.lock().unwrap().get(database_id) {
            return Ok(found.clone());
        }
        Ok(DiscoveredSchema {
            schema: self
                .schemas
                .lock()
                .unwrap()
                .get(database_id)
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn row_count(&self, database_id: &str, table: &str) -> Result<i64> {
        self.tables
            .lock()
            .unwrap()
            .get(&key(database_id, table))
            .map(|rows| rows.len() as i64)
            .ok_or_else(|| MappingError::not_found("table", format!("{}.{}", database_id, table)))
    }

    async fn create_database(&self, scope: &Scope, request: NewDatabase) -> Result<DatabaseRecord> {
        let record = DatabaseRecord {
            id: format!("db_{}", request.name),
            scope: scope.clone(),
            name: request.name.clone(),
            engine: request.engine.clone(),
            connected: true,
            instance_id: Some(request.instance_id.clone()),
            schema: None,
        };
        self.created.lock().unwrap().push(request);
        Ok(record)
    }
}

/// Schema matcher returning a preset result.
#[derive(Default)]
pub struct MockMatcher {
    result: Mutex<MatchResult>,
    unavailable: Mutex<bool>,
    requests: Mutex<Vec<MatchRequest>>,
    conversions: Mutex<Vec<(String, String)>>,
    converted: Mutex<Option<String>>,
}

impl MockMatcher {
    pub fn with_result(result: MatchResult) -> Self {
        let matcher = Self::default();
        *matcher.result.lock().unwrap() = result;
        matcher
    }

    pub fn unavailable() -> Self {
        let matcher = Self::default();
        *matcher.unavailable.lock().unwrap() = true;
        matcher
    }

    /// Make `convert_schema` answer with this raw JSON.
    pub fn convert_to(&self, json: &str) {
        *self.converted.lock().unwrap() = Some(json.to_string());
    }

    pub fn requests(&self) -> Vec<MatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn conversions(&self) -> Vec<(String, String)> {
        self.conversions.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnifiedModelService for MockMatcher {
    async fn match_schemas(&self, request: MatchRequest) -> Result<MatchResult> {
        self.requests.lock().unwrap().push(request);
        if *self.unavailable.lock().unwrap() {
            return Err(MappingError::unavailable("unified-model", "connection refused"));
        }
        Ok(self.result.lock().unwrap().clone())
    }

    async fn convert_schema(
        &self,
        source_engine: &str,
        target_engine: &str,
        schema: &SchemaModel,
    ) -> Result<String> {
        self.conversions
            .lock()
            .unwrap()
            .push((source_engine.to_string(), target_engine.to_string()));
        match self.converted.lock().unwrap().clone() {
            Some(json) => Ok(json),
            None => Ok(serde_json::to_string(schema)?),
        }
    }
}

/// Registry knowing a handful of transformations.
///
/// - `uppercase` (passthrough): upper-cases strings
/// - `merge_names` (merge): joins all source values with a space
/// - `generate_id` (generator), `audit_sink` (sink): described only
/// - `retired` (passthrough): described as invalid
#[derive(Default)]
pub struct UppercaseRegistry {
    calls: AtomicUsize,
}

impl UppercaseRegistry {
    /// Number of `apply` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformationRegistry for UppercaseRegistry {
    async fn describe(&self, name: &str) -> Result<Option<TransformationInfo>> {
        let (kind, valid) = match name {
            "uppercase" => (TransformationType::Passthrough, true),
            "merge_names" => (TransformationType::Merge, true),
            "generate_id" => (TransformationType::Generator, true),
            "audit_sink" => (TransformationType::Sink, true),
            "retired" => (TransformationType::Passthrough, false),
            _ => return Ok(None),
        };
        Ok(Some(TransformationInfo {
            name: name.to_string(),
            kind,
            valid,
        }))
    }

    async fn apply(
        &self,
        name: &str,
        _options: &BTreeMap<String, String>,
        inputs: Vec<Vec<Value>>,
    ) -> Result<Vec<Vec<Value>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match name {
            "uppercase" => Ok(inputs
                .into_iter()
                .map(|values| {
                    values
                        .into_iter()
                        .map(|v| match v {
                            Value::String(s) => Value::String(s.to_uppercase()),
                            other => other,
                        })
                        .collect()
                })
                .collect()),
            "merge_names" => Ok(inputs
                .into_iter()
                .map(|values| {
                    let joined = values
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" ");
                    vec![Value::String(joined)]
                })
                .collect()),
            other => Err(MappingError::not_found("transformation", other)),
        }
    }
}

/// Mesh transport recording what it was asked to send.
#[derive(Default)]
pub struct RecordingMesh {
    pub enabled: bool,
    /// Sends for this table fail.
    pub failing_table: Option<String>,
    sent: Mutex<Vec<BroadcastMessage>>,
}

impl RecordingMesh {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// An enabled mesh whose sends for `table` fail.
    pub fn failing(table: &str) -> Self {
        Self {
            enabled: true,
            failing_table: Some(table.to_string()),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<BroadcastMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeshTransport for RecordingMesh {
    fn should_broadcast(&self) -> bool {
        self.enabled
    }

    async fn send(&self, message: BroadcastMessage) -> Result<()> {
        if self.failing_table.as_deref() == Some(message.table.as_str()) {
            return Err(MappingError::unavailable("mesh", "no peers reachable"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
