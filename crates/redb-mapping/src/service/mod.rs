//! Service facade: the RPC surface of the mapping engine.
//!
//! [`MappingService`] wires the store and the external collaborators to the
//! components in this crate and exposes one method per RPC. Every call:
//!
//! - is logged at debug level on entry
//! - counts towards the request metrics (`requests`, `errors`, `in_flight`)
//! - checks that the tenant/workspace scope exists
//!
//! Mutations of mappings and rules are broadcast to peer nodes through the
//! fire-and-forget [`Broadcaster`].

mod data;
mod mappings;
mod rules;
mod validate;

pub use mappings::{AddMappingRequest, DeployedMapping, MappingChanges, MappingDetails};
pub use rules::{AddRuleRequest, RuleChanges};
pub use validate::ValidationReport;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::core::{
    resolve, BroadcastMessage, BroadcastOperation, ExecutionEngine, MeshTransport,
    ResolvedAddress, Scope, TransformationRegistry, UnifiedModelService,
};
use crate::deploy::SchemaDeployer;
use crate::error::{MappingError, Result};
use crate::matching::MatchOrchestrator;
use crate::metrics::{MetricsSnapshot, RequestMetrics};
use crate::pipeline::MigrationPipeline;
use crate::registry::StaticRegistry;
use crate::store::{MappingStore, PgMappingStore, ScopedDirectory};

/// Broadcast table names.
const MAPPINGS: &str = "mappings";
const RULES: &str = "rules";
const MAPPING_RULES: &str = "mapping_rules";
const MAPPING_FILTERS: &str = "mapping_filters";

/// External services the engine talks to.
pub struct Collaborators {
    pub engine: Arc<dyn ExecutionEngine>,
    pub matcher: Arc<dyn UnifiedModelService>,
    /// Remote transformation service. Falls back to the static registry from
    /// the `transformations` config section.
    pub registry: Option<Arc<dyn TransformationRegistry>>,
    /// Mesh transport. Without one, nothing is broadcast.
    pub mesh: Option<Arc<dyn MeshTransport>>,
}

/// The mapping and migration engine behind the RPC surface.
pub struct MappingService {
    store: Arc<dyn MappingStore>,
    registry: Arc<dyn TransformationRegistry>,
    matcher: MatchOrchestrator,
    deployer: SchemaDeployer,
    pipeline: MigrationPipeline,
    broadcaster: Broadcaster,
    metrics: RequestMetrics,
}

impl MappingService {
    pub fn new(config: &Config, store: Arc<dyn MappingStore>, collaborators: Collaborators) -> Self {
        let registry: Arc<dyn TransformationRegistry> = match collaborators.registry {
            Some(registry) => registry,
            None => {
                info!(
                    "No transformation service configured, using {} static transformations",
                    config.transformations.len()
                );
                Arc::new(StaticRegistry::new(&config.transformations))
            }
        };
        let broadcaster = match collaborators.mesh {
            Some(mesh) => Broadcaster::new(mesh, &config.broadcast),
            None => Broadcaster::disabled(),
        };

        Self {
            matcher: MatchOrchestrator::new(
                store.clone(),
                collaborators.matcher.clone(),
                config.matching.match_options(),
            ),
            deployer: SchemaDeployer::new(
                store.clone(),
                collaborators.engine.clone(),
                collaborators.matcher,
            ),
            pipeline: MigrationPipeline::new(
                store.clone(),
                collaborators.engine,
                registry.clone(),
                config.copy.clone(),
            ),
            store,
            registry,
            broadcaster,
            metrics: RequestMetrics::new(),
        }
    }

    /// Connect to the PostgreSQL store from `config` and initialize its schema.
    pub async fn connect(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let store = PgMappingStore::connect(&config.store).await?;
        store.init_schema().await?;
        info!("Mapping store ready ({})", store.backend_type());
        Ok(Self::new(config, Arc::new(store), collaborators))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The pipeline running data movement; its shutdown token stops copies.
    pub fn pipeline(&self) -> &MigrationPipeline {
        &self.pipeline
    }

    /// Run one RPC body with entry logging and request metrics.
    async fn tracked<T, F>(&self, rpc: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        debug!("{} called", rpc);
        let guard = self.metrics.start();
        guard.finish(call.await)
    }

    async fn require_workspace(&self, scope: &Scope) -> Result<()> {
        if !self.store.workspace_exists(scope).await? {
            return Err(MappingError::not_found("workspace", scope.to_string()));
        }
        Ok(())
    }

    /// Parse an address and resolve its database id within `scope`.
    async fn resolve_address(&self, scope: &Scope, input: &str) -> Result<ResolvedAddress> {
        resolve(input, &ScopedDirectory::new(self.store.as_ref(), scope)).await
    }
}

/// Broadcast messages of one mutation, owners pushed before dependents.
#[derive(Default)]
struct Outbox {
    messages: Vec<BroadcastMessage>,
}

impl Outbox {
    fn push<T: Serialize>(
        &mut self,
        table: &str,
        operation: BroadcastOperation,
        primary_key: impl Into<String>,
        record: &T,
    ) {
        let primary_key = primary_key.into();
        match serde_json::to_value(record) {
            Ok(record) => self.messages.push(BroadcastMessage {
                table: table.to_string(),
                operation,
                record,
                primary_key,
            }),
            Err(e) => warn!("Not broadcasting {} '{}': {}", table, primary_key, e),
        }
    }

    fn send(self, broadcaster: &Broadcaster) {
        broadcaster.publish(self.messages);
    }
}

#[derive(Serialize)]
struct LinkRecord<'a> {
    mapping_id: &'a str,
    rule_id: &'a str,
    order: i32,
}

fn link_key(mapping_id: &str, rule_id: &str) -> String {
    format!("{}:{}", mapping_id, rule_id)
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Collaborators, MappingService};
    use crate::config::Config;
    use crate::core::{BroadcastMessage, MatchResult};
    use crate::store::{MappingStore, MemoryStore};
    use crate::testing::{
        database, scope, MockEngine, MockMatcher, RecordingMesh, UppercaseRegistry,
    };

    const CONFIG: &str = r#"
store:
  host: localhost
  database: controlplane
  user: redb
broadcast:
  enabled: true
copy:
  batch_size: 4
  parallel_workers: 1
"#;

    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub engine: Arc<MockEngine>,
        pub matcher: Arc<MockMatcher>,
        pub mesh: Arc<RecordingMesh>,
        pub service: MappingService,
    }

    impl Fixture {
        /// Wait for the detached broadcast task to deliver `count` messages.
        pub async fn broadcasts(&self, count: usize) -> Vec<BroadcastMessage> {
            for _ in 0..100 {
                let sent = self.mesh.sent();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.mesh.sent()
        }
    }

    pub async fn fixture() -> Fixture {
        fixture_with_matches(MatchResult::default()).await
    }

    pub async fn fixture_with_matches(matches: MatchResult) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put_workspace(&scope()).await.unwrap();
        store.put_database(&database("src", true)).await.unwrap();
        store.put_database(&database("dst", true)).await.unwrap();

        let engine = Arc::new(MockEngine::default());
        let matcher = Arc::new(MockMatcher::with_result(matches));
        let registry = Arc::new(UppercaseRegistry::default());
        let mesh = Arc::new(RecordingMesh::enabled());
        let config = Config::from_yaml(CONFIG).unwrap();

        let service = MappingService::new(
            &config,
            store.clone(),
            Collaborators {
                engine: engine.clone(),
                matcher: matcher.clone(),
                registry: Some(registry),
                mesh: Some(mesh.clone()),
            },
        );
        Fixture {
            store,
            engine,
            matcher,
            mesh,
            service,
        }
    }
}
