//! PostgreSQL-backed mapping store.
//!
//! Stores mappings, rules and discovered resources in tables within a
//! dedicated schema (`redb_mapping` by default). Free-form metadata, options,
//! item lists and schema models are stored as JSON text.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use super::{MappingStore, RuleLink};
use crate::config::StoreConfig;
use crate::core::{
    CommitSchema, DatabaseRecord, Mapping, MappingFilter, ResourceAddress, ResourceContainer,
    ResourceItem, Rule, Scope, ValidationState,
};
use crate::error::{MappingError, Result};

const MAPPING_COLUMNS: &str = "id, tenant_id, workspace_id, name, description, source_kind, \
     target_kind, source_address, target_address, source_container_id, target_container_id, \
     provenance, validated, validated_at, validation_errors, validation_warnings, rule_count, \
     owner_id, created_at, updated_at";

const RULE_COLUMNS: &str = "id, tenant_id, workspace_id, name, description, cardinality, \
     source_items, target_items, transformation, options, metadata, owner_id, created_at, \
     updated_at";

/// Mapping store on a PostgreSQL connection pool.
pub struct PgMappingStore {
    pool: Pool,
    schema: String,
}

impl PgMappingStore {
    /// Create a store on an existing pool.
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Build a pool from configuration and test the connection.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match config.ssl_mode.as_str() {
            "disable" => {
                warn!("Mapping store TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
            mode => {
                info!("ssl_mode={}: certificate verification enabled", mode);
                Manager::from_config(pg_config, tls_connector(), mgr_config)
            }
        };

        let pool = Pool::builder(mgr)
            .max_size(config.get_max_connections())
            .build()
            .map_err(|e| {
                MappingError::unavailable("store", format!("failed to create pool: {}", e))
            })?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to mapping store: {}:{}/{} (schema {})",
            config.host, config.port, config.database, config.schema
        );

        Ok(Self::new(pool, config.schema.clone()))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn touch_mapping(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        mapping_id: &str,
    ) -> Result<()> {
        tx.execute(
            &format!(
                "UPDATE {} SET
                    rule_count = (SELECT COUNT(*) FROM {} WHERE mapping_id = $1)::int4,
                    validated = FALSE,
                    updated_at = NOW()
                 WHERE id = $1",
                self.table("mappings"),
                self.table("mapping_rules")
            ),
            &[&mapping_id],
        )
        .await?;
        Ok(())
    }

    async fn write_mapping(&self, mapping: &Mapping) -> Result<()> {
        let conn = self.pool.get().await?;
        let rule_count = mapping.rule_count as i32;
        conn.execute(
            &format!(
                "INSERT INTO {} ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                         $17, $18, $19, $20)",
                self.table("mappings"),
                MAPPING_COLUMNS
            ),
            &[
                &mapping.id,
                &mapping.scope.tenant_id,
                &mapping.scope.workspace_id,
                &mapping.name,
                &mapping.description,
                &mapping.source_kind.as_str(),
                &mapping.target_kind.as_str(),
                &mapping.source.to_string(),
                &mapping.target.to_string(),
                &mapping.source_container_id,
                &mapping.target_container_id,
                &to_json(&mapping.provenance)?,
                &mapping.validation.validated,
                &mapping.validation.validated_at,
                &to_json(&mapping.validation.errors)?,
                &to_json(&mapping.validation.warnings)?,
                &rule_count,
                &mapping.owner_id,
                &mapping.created_at,
                &mapping.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn upsert_rule(&self, rule: &Rule, insert_only: bool) -> Result<()> {
        let conn = self.pool.get().await?;
        let conflict = if insert_only {
            ""
        } else {
            "ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                cardinality = EXCLUDED.cardinality,
                source_items = EXCLUDED.source_items,
                target_items = EXCLUDED.target_items,
                transformation = EXCLUDED.transformation,
                options = EXCLUDED.options,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at"
        };

        conn.execute(
            &format!(
                "INSERT INTO {} ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                 {}",
                self.table("rules"),
                RULE_COLUMNS,
                conflict
            ),
            &[
                &rule.id,
                &rule.scope.tenant_id,
                &rule.scope.workspace_id,
                &rule.name,
                &rule.description,
                &rule.cardinality.as_str(),
                &to_json(&rule.source_items)?,
                &to_json(&rule.target_items)?,
                &rule.transformation,
                &to_json(&rule.options)?,
                &to_json(&rule.metadata)?,
                &rule.owner_id,
                &rule.created_at,
                &rule.updated_at,
            ],
        )
        .await?;
        Ok(())
    }
}

fn tls_connector() -> MakeRustlsConnect {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    MakeRustlsConnect::new(config)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(column: &str, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| MappingError::internal(format!("corrupt {} column: {}", column, e)))
}

fn mapping_from_row(row: &Row) -> Result<Mapping> {
    let source: String = row.get("source_address");
    let target: String = row.get("target_address");
    let source_kind: String = row.get("source_kind");
    let target_kind: String = row.get("target_kind");
    let provenance: String = row.get("provenance");
    let errors: String = row.get("validation_errors");
    let warnings: String = row.get("validation_warnings");
    let rule_count: i32 = row.get("rule_count");

    Ok(Mapping {
        id: row.get("id"),
        scope: Scope::new(
            row.get::<_, String>("tenant_id"),
            row.get::<_, String>("workspace_id"),
        ),
        name: row.get("name"),
        description: row.get("description"),
        source_kind: source_kind.parse()?,
        target_kind: target_kind.parse()?,
        source: ResourceAddress::parse(&source)?,
        target: ResourceAddress::parse(&target)?,
        source_container_id: row.get("source_container_id"),
        target_container_id: row.get("target_container_id"),
        provenance: from_json("provenance", &provenance)?,
        validation: ValidationState {
            validated: row.get("validated"),
            validated_at: row.get("validated_at"),
            errors: from_json("validation_errors", &errors)?,
            warnings: from_json("validation_warnings", &warnings)?,
        },
        rule_count: rule_count.max(0) as usize,
        owner_id: row.get("owner_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn rule_from_row(row: &Row) -> Result<Rule> {
    let cardinality: String = row.get("cardinality");
    let source_items: String = row.get("source_items");
    let target_items: String = row.get("target_items");
    let options: String = row.get("options");
    let metadata: String = row.get("metadata");

    Ok(Rule {
        id: row.get("id"),
        scope: Scope::new(
            row.get::<_, String>("tenant_id"),
            row.get::<_, String>("workspace_id"),
        ),
        name: row.get("name"),
        description: row.get("description"),
        cardinality: cardinality.parse()?,
        source_items: from_json("source_items", &source_items)?,
        target_items: from_json("target_items", &target_items)?,
        transformation: row.get("transformation"),
        options: from_json("options", &options)?,
        metadata: from_json("metadata", &metadata)?,
        owner_id: row.get("owner_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn filter_from_row(row: &Row) -> Result<MappingFilter> {
    let filter_type: String = row.get("filter_type");
    let expression: String = row.get("expression");
    let operator: String = row.get("operator");

    Ok(MappingFilter {
        id: row.get("id"),
        mapping_id: row.get("mapping_id"),
        filter_type: filter_type.parse()?,
        expression: from_json("expression", &expression)?,
        order: row.get("filter_order"),
        operator: operator.parse()?,
    })
}

fn container_from_row(row: &Row) -> Result<ResourceContainer> {
    let kind: String = row.get("kind");
    let address: String = row.get("address");
    Ok(ResourceContainer {
        id: row.get("id"),
        database_id: row.get("database_id"),
        kind: kind.parse()?,
        name: row.get("name"),
        address: ResourceAddress::parse(&address)?,
        estimated_rows: row.get("estimated_rows"),
    })
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            &[],
        )
        .await?;

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (tenant_id, workspace_id)
                )",
                self.table("workspaces")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    connected BOOLEAN NOT NULL DEFAULT FALSE,
                    instance_id TEXT,
                    schema_model TEXT
                )",
                self.table("databases")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    database_id TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('table', 'stream_topic')),
                    name TEXT NOT NULL,
                    address TEXT NOT NULL UNIQUE,
                    estimated_rows BIGINT
                )",
                self.table("resource_containers")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    container_id TEXT NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    item TEXT NOT NULL
                )",
                self.table("resource_items"),
                self.table("resource_containers")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_id TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    schema_model TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, workspace_id, repo, branch, commit_id)
                )",
                self.table("commit_schemas")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    source_kind TEXT NOT NULL,
                    target_kind TEXT NOT NULL,
                    source_address TEXT NOT NULL,
                    target_address TEXT NOT NULL,
                    source_container_id TEXT,
                    target_container_id TEXT,
                    provenance TEXT NOT NULL DEFAULT '{{}}',
                    validated BOOLEAN NOT NULL DEFAULT FALSE,
                    validated_at TIMESTAMPTZ,
                    validation_errors TEXT NOT NULL DEFAULT '[]',
                    validation_warnings TEXT NOT NULL DEFAULT '[]',
                    rule_count INTEGER NOT NULL DEFAULT 0,
                    owner_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (tenant_id, workspace_id, name)
                )",
                self.table("mappings")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    cardinality TEXT NOT NULL,
                    source_items TEXT NOT NULL,
                    target_items TEXT NOT NULL,
                    transformation TEXT NOT NULL,
                    options TEXT NOT NULL DEFAULT '{{}}',
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    owner_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (tenant_id, workspace_id, name)
                )",
                self.table("rules")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    mapping_id TEXT NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                    rule_id TEXT NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                    rule_order INTEGER NOT NULL,
                    PRIMARY KEY (mapping_id, rule_id)
                )",
                self.table("mapping_rules"),
                self.table("mappings"),
                self.table("rules")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    mapping_id TEXT NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                    filter_type TEXT NOT NULL CHECK (filter_type IN ('where', 'limit', 'order_by', 'custom')),
                    expression TEXT NOT NULL,
                    filter_order INTEGER NOT NULL,
                    operator TEXT NOT NULL CHECK (operator IN ('AND', 'OR'))
                )",
                self.table("mapping_filters"),
                self.table("mappings")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_mapping_rules_rule ON {}(rule_id)",
                self.table("mapping_rules")
            ),
        ];

        for statement in &statements {
            conn.execute(statement.as_str(), &[]).await?;
        }

        debug!("Mapping store schema {} is ready", self.schema);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn workspace_exists(&self, scope: &Scope) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT 1 FROM {} WHERE tenant_id = $1 AND workspace_id = $2",
                    self.table("workspaces")
                ),
                &[&scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn put_workspace(&self, scope: &Scope) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (tenant_id, workspace_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
                self.table("workspaces")
            ),
            &[&scope.tenant_id, &scope.workspace_id],
        )
        .await?;
        Ok(())
    }

    async fn get_database(
        &self,
        scope: &Scope,
        database_id: &str,
    ) -> Result<Option<DatabaseRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT id, name, engine, connected, instance_id, schema_model
                     FROM {}
                     WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3",
                    self.table("databases")
                ),
                &[&database_id, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let schema_text: Option<String> = row.get("schema_model");
        let schema = match schema_text {
            Some(text) => Some(from_json("schema_model", &text)?),
            None => None,
        };

        Ok(Some(DatabaseRecord {
            id: row.get("id"),
            scope: scope.clone(),
            name: row.get("name"),
            engine: row.get("engine"),
            connected: row.get("connected"),
            instance_id: row.get("instance_id"),
            schema,
        }))
    }

    async fn put_database(&self, database: &DatabaseRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        let schema_text = match &database.schema {
            Some(schema) => Some(to_json(schema)?),
            None => None,
        };
        conn.execute(
            &format!(
                "INSERT INTO {} (id, tenant_id, workspace_id, name, engine, connected, instance_id, schema_model)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    engine = EXCLUDED.engine,
                    connected = EXCLUDED.connected,
                    instance_id = EXCLUDED.instance_id,
                    schema_model = EXCLUDED.schema_model",
                self.table("databases")
            ),
            &[
                &database.id,
                &database.scope.tenant_id,
                &database.scope.workspace_id,
                &database.name,
                &database.engine,
                &database.connected,
                &database.instance_id,
                &schema_text,
            ],
        )
        .await?;
        Ok(())
    }

    async fn upsert_container(
        &self,
        container: &ResourceContainer,
        items: &[ResourceItem],
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!(
                "INSERT INTO {} (id, database_id, kind, name, address, estimated_rows)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    name = EXCLUDED.name,
                    address = EXCLUDED.address,
                    estimated_rows = EXCLUDED.estimated_rows",
                self.table("resource_containers")
            ),
            &[
                &container.id,
                &container.database_id,
                &container.kind.as_str(),
                &container.name,
                &container.address.to_string(),
                &container.estimated_rows,
            ],
        )
        .await?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE container_id = $1",
                self.table("resource_items")
            ),
            &[&container.id],
        )
        .await?;

        for (position, item) in items.iter().enumerate() {
            let position = position as i32;
            tx.execute(
                &format!(
                    "INSERT INTO {} (id, container_id, position, item) VALUES ($1, $2, $3, $4)",
                    self.table("resource_items")
                ),
                &[&item.id, &container.id, &position, &to_json(item)?],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_container(
        &self,
        address: &ResourceAddress,
    ) -> Result<Option<ResourceContainer>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT id, database_id, kind, name, address, estimated_rows
                     FROM {} WHERE address = $1",
                    self.table("resource_containers")
                ),
                &[&address.to_string()],
            )
            .await?;
        row.as_ref().map(container_from_row).transpose()
    }

    async fn list_items(&self, container_id: &str) -> Result<Vec<ResourceItem>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT item FROM {} WHERE container_id = $1 ORDER BY position",
                    self.table("resource_items")
                ),
                &[&container_id],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let text: String = row.get(0);
                from_json("item", &text)
            })
            .collect()
    }

    async fn put_commit_schema(&self, scope: &Scope, commit: &CommitSchema) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (tenant_id, workspace_id, repo, branch, commit_id, engine, schema_model)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (tenant_id, workspace_id, repo, branch, commit_id) DO UPDATE SET
                    engine = EXCLUDED.engine,
                    schema_model = EXCLUDED.schema_model",
                self.table("commit_schemas")
            ),
            &[
                &scope.tenant_id,
                &scope.workspace_id,
                &commit.repo,
                &commit.branch,
                &commit.commit,
                &commit.engine,
                &to_json(&commit.schema)?,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_commit_schema(
        &self,
        scope: &Scope,
        repo: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Option<CommitSchema>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT engine, schema_model FROM {}
                     WHERE tenant_id = $1 AND workspace_id = $2
                       AND repo = $3 AND branch = $4 AND commit_id = $5",
                    self.table("commit_schemas")
                ),
                &[
                    &scope.tenant_id,
                    &scope.workspace_id,
                    &repo,
                    &branch,
                    &commit,
                ],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let text: String = row.get("schema_model");
        Ok(Some(CommitSchema {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit: commit.to_string(),
            engine: row.get("engine"),
            schema: from_json("schema_model", &text)?,
        }))
    }

    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        self.write_mapping(mapping).await
    }

    async fn update_mapping_details(
        &self,
        scope: &Scope,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Mapping> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE {} SET name = $4, description = $5, updated_at = NOW()
                     WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3
                     RETURNING {}",
                    self.table("mappings"),
                    MAPPING_COLUMNS
                ),
                &[&id, &scope.tenant_id, &scope.workspace_id, &name, &description],
            )
            .await?
            .ok_or_else(|| MappingError::not_found("mapping", id))?;
        mapping_from_row(&row)
    }

    async fn get_mapping(&self, scope: &Scope, id: &str) -> Result<Option<Mapping>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3",
                    MAPPING_COLUMNS,
                    self.table("mappings")
                ),
                &[&id, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn find_mapping_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Mapping>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE name = $1 AND tenant_id = $2 AND workspace_id = $3",
                    MAPPING_COLUMNS,
                    self.table("mappings")
                ),
                &[&name, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn list_mappings(&self, scope: &Scope) -> Result<Vec<Mapping>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE tenant_id = $1 AND workspace_id = $2
                     ORDER BY created_at, name",
                    MAPPING_COLUMNS,
                    self.table("mappings")
                ),
                &[&scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn delete_mapping(&self, scope: &Scope, id: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        // links and filters go with it through ON DELETE CASCADE
        let deleted = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3",
                    self.table("mappings")
                ),
                &[&id, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn record_validation(&self, mapping_id: &str, state: &ValidationState) -> Result<()> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET
                        validated = $2,
                        validated_at = $3,
                        validation_errors = $4,
                        validation_warnings = $5,
                        updated_at = NOW()
                     WHERE id = $1",
                    self.table("mappings")
                ),
                &[
                    &mapping_id,
                    &state.validated,
                    &state.validated_at,
                    &to_json(&state.errors)?,
                    &to_json(&state.warnings)?,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(MappingError::not_found("mapping", mapping_id));
        }
        Ok(())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        self.upsert_rule(rule, true).await
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        self.upsert_rule(rule, false).await
    }

    async fn get_rule(&self, scope: &Scope, id: &str) -> Result<Option<Rule>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3",
                    RULE_COLUMNS,
                    self.table("rules")
                ),
                &[&id, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn find_rule_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Rule>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE name = $1 AND tenant_id = $2 AND workspace_id = $3",
                    RULE_COLUMNS,
                    self.table("rules")
                ),
                &[&name, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_rules(&self, scope: &Scope) -> Result<Vec<Rule>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE tenant_id = $1 AND workspace_id = $2
                     ORDER BY created_at, name",
                    RULE_COLUMNS,
                    self.table("rules")
                ),
                &[&scope.tenant_id, &scope.workspace_id],
            )
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn delete_rule(&self, scope: &Scope, id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let affected: Vec<String> = tx
            .query(
                &format!(
                    "SELECT mapping_id FROM {} WHERE rule_id = $1",
                    self.table("mapping_rules")
                ),
                &[&id],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let deleted = tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = $1 AND tenant_id = $2 AND workspace_id = $3",
                    self.table("rules")
                ),
                &[&id, &scope.tenant_id, &scope.workspace_id],
            )
            .await?;

        if deleted > 0 {
            for mapping_id in &affected {
                self.touch_mapping(&tx, mapping_id).await?;
            }
        }

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn attach_rule(
        &self,
        mapping_id: &str,
        rule_id: &str,
        order: Option<i32>,
    ) -> Result<i32> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let mapping_exists = tx
            .query_opt(
                &format!("SELECT 1 FROM {} WHERE id = $1", self.table("mappings")),
                &[&mapping_id],
            )
            .await?
            .is_some();
        if !mapping_exists {
            return Err(MappingError::not_found("mapping", mapping_id));
        }
        let rule_exists = tx
            .query_opt(
                &format!("SELECT 1 FROM {} WHERE id = $1", self.table("rules")),
                &[&rule_id],
            )
            .await?
            .is_some();
        if !rule_exists {
            return Err(MappingError::not_found("rule", rule_id));
        }

        let order = match order {
            Some(order) => order,
            None => tx
                .query_one(
                    &format!(
                        "SELECT COALESCE(MAX(rule_order) + 1, 0)::int4 FROM {} WHERE mapping_id = $1",
                        self.table("mapping_rules")
                    ),
                    &[&mapping_id],
                )
                .await?
                .get(0),
        };

        tx.execute(
            &format!(
                "INSERT INTO {} (mapping_id, rule_id, rule_order) VALUES ($1, $2, $3)
                 ON CONFLICT (mapping_id, rule_id) DO UPDATE SET rule_order = EXCLUDED.rule_order",
                self.table("mapping_rules")
            ),
            &[&mapping_id, &rule_id, &order],
        )
        .await?;
        self.touch_mapping(&tx, mapping_id).await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn detach_rule(&self, mapping_id: &str, rule_id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let removed = tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE mapping_id = $1 AND rule_id = $2",
                    self.table("mapping_rules")
                ),
                &[&mapping_id, &rule_id],
            )
            .await?;
        if removed > 0 {
            self.touch_mapping(&tx, mapping_id).await?;
        }

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn mapping_links(&self, mapping_id: &str) -> Result<Vec<RuleLink>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT rule_id, rule_order FROM {} WHERE mapping_id = $1
                     ORDER BY rule_order, rule_id",
                    self.table("mapping_rules")
                ),
                &[&mapping_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| RuleLink {
                mapping_id: mapping_id.to_string(),
                rule_id: row.get(0),
                order: row.get(1),
            })
            .collect())
    }

    async fn mappings_for_rule(&self, rule_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT mapping_id FROM {} WHERE rule_id = $1",
                    self.table("mapping_rules")
                ),
                &[&rule_id],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn invalidate_mappings_for_rule(&self, rule_id: &str) -> Result<usize> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET validated = FALSE, updated_at = NOW()
                     WHERE id IN (SELECT mapping_id FROM {} WHERE rule_id = $1)",
                    self.table("mappings"),
                    self.table("mapping_rules")
                ),
                &[&rule_id],
            )
            .await?;
        Ok(updated as usize)
    }

    async fn add_filter(&self, filter: &MappingFilter) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!(
                "INSERT INTO {} (id, mapping_id, filter_type, expression, filter_order, operator)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                self.table("mapping_filters")
            ),
            &[
                &filter.id,
                &filter.mapping_id,
                &filter.filter_type.as_str(),
                &to_json(&filter.expression)?,
                &filter.order,
                &filter.operator.as_str(),
            ],
        )
        .await?;
        tx.execute(
            &format!(
                "UPDATE {} SET validated = FALSE, updated_at = NOW() WHERE id = $1",
                self.table("mappings")
            ),
            &[&filter.mapping_id],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_filter(&self, mapping_id: &str, filter_id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let removed = tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = $1 AND mapping_id = $2",
                    self.table("mapping_filters")
                ),
                &[&filter_id, &mapping_id],
            )
            .await?;
        if removed > 0 {
            tx.execute(
                &format!(
                    "UPDATE {} SET validated = FALSE, updated_at = NOW() WHERE id = $1",
                    self.table("mappings")
                ),
                &[&mapping_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn list_filters(&self, mapping_id: &str) -> Result<Vec<MappingFilter>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT id, mapping_id, filter_type, expression, filter_order, operator
                     FROM {} WHERE mapping_id = $1 ORDER BY filter_order, id",
                    self.table("mapping_filters")
                ),
                &[&mapping_id],
            )
            .await?;
        rows.iter().map(filter_from_row).collect()
    }
}

