//! Schema conversion and deployment.
//!
//! Deploying a table walks these stages:
//!
//! ```text
//! located -> existence-checked -> type-filtered -> [converted] -> deployed
//!         -> discovery-refreshed (best-effort)
//! ```
//!
//! Nothing is written before `deployed`, so any earlier failure leaves no trace.
//! A failed discovery refresh is only logged: the table exists, it just cannot
//! be matched against until the next discovery run.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::{
    DatabaseRecord, DiscoveredSchema, ExecutionEngine, NewDatabase, SchemaModel, Scope,
    UnifiedModelService,
};
use crate::error::{MappingError, Result};
use crate::store::MappingStore;

/// Stage reached by a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeployStage {
    Located,
    ExistenceChecked,
    TypeFiltered,
    Converted,
    Deployed,
    DiscoveryRefreshed,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStage::Located => "schema located",
            DeployStage::ExistenceChecked => "existence checked",
            DeployStage::TypeFiltered => "types filtered",
            DeployStage::Converted => "converted",
            DeployStage::Deployed => "deployed",
            DeployStage::DiscoveryRefreshed => "discovery refreshed",
        };
        f.write_str(s)
    }
}

/// A single-table deployment request.
#[derive(Debug, Clone)]
pub struct TableDeployRequest {
    pub source_database_id: String,
    pub table: String,
    pub target_database_id: String,
    /// Deploy under this name instead of the source name.
    pub rename_to: Option<String>,
}

impl TableDeployRequest {
    pub fn target_table(&self) -> &str {
        self.rename_to.as_deref().unwrap_or(&self.table)
    }
}

/// Result of a table deployment.
#[derive(Debug, Clone)]
pub struct DeployedTable {
    pub database_id: String,
    pub table: String,
    /// The model that was deployed (after conversion and rename).
    pub schema: SchemaModel,
    /// Last stage reached: `Deployed` or `DiscoveryRefreshed`.
    pub stage: DeployStage,
}

/// Where a commit schema is deployed.
#[derive(Debug, Clone)]
pub enum DeployTarget {
    /// Create a database on an instance.
    New { instance_id: String, name: String },
    /// Wipe an existing database and deploy into it.
    Existing { database_id: String },
}

/// A commit deploy target once it has been looked up.
enum Destination {
    Existing(DatabaseRecord),
    New(NewDatabase),
}

/// Result of `DeployCommitSchema`.
#[derive(Debug, Clone)]
pub struct CommitDeployment {
    pub database_id: String,
    pub schema: SchemaModel,
    pub repo_id: Option<String>,
    pub branch_id: Option<String>,
    pub commit_id: Option<String>,
}

pub struct SchemaDeployer {
    store: Arc<dyn MappingStore>,
    engine: Arc<dyn ExecutionEngine>,
    converter: Arc<dyn UnifiedModelService>,
}

impl SchemaDeployer {
    pub fn new(
        store: Arc<dyn MappingStore>,
        engine: Arc<dyn ExecutionEngine>,
        converter: Arc<dyn UnifiedModelService>,
    ) -> Self {
        Self {
            store,
            engine,
            converter,
        }
    }

    /// Deploy one table, with exactly the user-defined types it references,
    /// into another database.
    pub async fn deploy_table(
        &self,
        scope: &Scope,
        request: &TableDeployRequest,
    ) -> Result<DeployedTable> {
        let source = self.database(scope, &request.source_database_id).await?;
        let target = self.database(scope, &request.target_database_id).await?;
        target.require_connected("target")?;
        let target_table = request.target_table().to_string();

        let full = source.require_schema()?;
        if !full.has_table(&request.table) {
            return Err(MappingError::not_found(
                "table",
                format!("{}.{}", source.id, request.table),
            ));
        }
        self.advance(&request.table, DeployStage::Located);

        // Live fetch: the cached schema on the record may be stale.
        let live = self.engine.fetch_schema(&target.id).await?;
        if live.has_table(&target_table) {
            return Err(MappingError::precondition(format!(
                "table '{}' already exists in database '{}'",
                target_table, target.name
            )));
        }
        self.advance(&request.table, DeployStage::ExistenceChecked);

        let mut model = full.extract_table(&request.table)?;
        debug!(
            "{}: carrying {} of {} user-defined types",
            request.table,
            model.types.len(),
            full.types.len()
        );
        self.advance(&request.table, DeployStage::TypeFiltered);

        model = self.convert(model, &source.engine, &target.engine).await?;
        if source.engine != target.engine {
            self.advance(&request.table, DeployStage::Converted);
        }

        if let Some(new_name) = &request.rename_to {
            let current = model
                .tables
                .first()
                .map(|t| t.name.clone())
                .ok_or_else(|| MappingError::internal("converted schema has no table"))?;
            model.rename_table(&current, new_name)?;
        }

        self.engine.deploy_schema(&target.id, &model).await?;
        self.advance(&request.table, DeployStage::Deployed);
        info!(
            "Deployed table {} from {} to {}.{}",
            request.table, source.name, target.name, target_table
        );

        let stage = if self.refresh(scope, &target.id).await.is_some() {
            DeployStage::DiscoveryRefreshed
        } else {
            DeployStage::Deployed
        };

        Ok(DeployedTable {
            database_id: target.id,
            table: target_table,
            schema: model,
            stage,
        })
    }

    /// Deploy the schema stored for a repository commit.
    pub async fn deploy_commit_schema(
        &self,
        scope: &Scope,
        repo: &str,
        branch: &str,
        commit: &str,
        target: DeployTarget,
    ) -> Result<CommitDeployment> {
        let stored = self
            .store
            .get_commit_schema(scope, repo, branch, commit)
            .await?
            .ok_or_else(|| {
                MappingError::not_found("commit schema", format!("{}/{}@{}", repo, branch, commit))
            })?;

        // Convert before touching the target: a failed conversion must leave
        // the target database as it was.
        let destination = match target {
            DeployTarget::Existing { database_id } => {
                let existing = self.database(scope, &database_id).await?;
                existing.require_connected("target")?;
                Destination::Existing(existing)
            }
            DeployTarget::New { instance_id, name } => Destination::New(NewDatabase {
                instance_id,
                name,
                engine: stored.engine.clone(),
            }),
        };
        let schema = match &destination {
            Destination::Existing(db) => {
                self.convert(stored.schema, &stored.engine, &db.engine).await?
            }
            Destination::New(_) => stored.schema,
        };

        let database = match destination {
            Destination::Existing(existing) => {
                self.engine.wipe_database(&existing.id).await?;
                info!("Wiped database {} before deploying commit {}", existing.name, commit);
                existing
            }
            Destination::New(new_database) => {
                let created = self.engine.create_database(scope, new_database).await?;
                self.store.put_database(&created).await?;
                info!("Created database {} ({}) for commit {}", created.name, created.id, commit);
                created
            }
        };

        self.engine.deploy_schema(&database.id, &schema).await?;
        info!(
            "Deployed {} tables of {}/{}@{} to {}",
            schema.tables.len(),
            repo,
            branch,
            commit,
            database.name
        );

        let discovered = self.refresh(scope, &database.id).await;
        Ok(CommitDeployment {
            database_id: database.id,
            schema,
            repo_id: discovered.as_ref().and_then(|d| d.repo_id.clone()),
            branch_id: discovered.as_ref().and_then(|d| d.branch_id.clone()),
            commit_id: discovered.and_then(|d| d.commit_id),
        })
    }

    fn advance(&self, table: &str, stage: DeployStage) {
        debug!("{}: {}", table, stage);
    }

    async fn database(&self, scope: &Scope, id: &str) -> Result<DatabaseRecord> {
        self.store
            .get_database(scope, id)
            .await?
            .ok_or_else(|| MappingError::not_found("database", id))
    }

    async fn convert(&self, model: SchemaModel, from: &str, to: &str) -> Result<SchemaModel> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(model);
        }
        info!("Converting schema from {} to {}", from, to);
        let json = self.converter.convert_schema(from, to, &model).await?;
        SchemaModel::from_json(&json)
    }

    /// Best-effort discovery refresh; records what was found.
    async fn refresh(&self, scope: &Scope, database_id: &str) -> Option<DiscoveredSchema> {
        let discovered = match self.engine.refresh_discovery(database_id).await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(
                    "Discovery refresh of {} failed, new columns are not addressable yet: {}",
                    database_id, e
                );
                return None;
            }
        };
        if let Err(e) = self.record_discovery(scope, database_id, &discovered).await {
            warn!("Could not store discovery of {}: {}", database_id, e);
            return None;
        }
        Some(discovered)
    }

    async fn record_discovery(
        &self,
        scope: &Scope,
        database_id: &str,
        discovered: &DiscoveredSchema,
    ) -> Result<()> {
        let mut database = self.database(scope, database_id).await?;
        database.schema = Some(discovered.schema.clone());
        self.store.put_database(&database).await?;
        for (container, items) in &discovered.containers {
            self.store.upsert_container(container, items).await?;
        }
        debug!(
            "Recorded {} discovered containers for {}",
            discovered.containers.len(),
            database_id
        );
        Ok(())
    }
}
