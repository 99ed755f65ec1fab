//! Mapping RPCs: creation per endpoint kind, listing, modification, deletion.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{link_key, LinkRecord, MappingService, Outbox, MAPPINGS, MAPPING_RULES, RULES};
use crate::core::{
    AttachedRule, BroadcastOperation, Mapping, MappingFilter, ResolvedAddress, ResourceAddress,
    ResourceKind, Scope, ValidationState,
};
use crate::deploy::{DeployedTable, TableDeployRequest};
use crate::error::{MappingError, Result};
use crate::store::{attached_rules, require_mapping};

/// Request to declare a mapping.
#[derive(Debug, Clone, Default)]
pub struct AddMappingRequest {
    pub name: String,
    pub description: String,
    /// Source address, any supported form.
    pub source: String,
    /// Target address, any supported form.
    pub target: String,
    /// Ask the schema matcher for rules once the mapping exists.
    pub generate_rules: bool,
    pub owner_id: String,
}

/// A mapping with its ordered rules and filters.
#[derive(Debug, Clone)]
pub struct MappingDetails {
    pub mapping: Mapping,
    pub rules: Vec<AttachedRule>,
    pub filters: Vec<MappingFilter>,
}

/// Partial update of a mapping. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct MappingChanges {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Result of `AddTableMappingWithDeploy`.
#[derive(Debug, Clone)]
pub struct DeployedMapping {
    pub deployed: DeployedTable,
    pub mapping: Mapping,
}

impl MappingService {
    /// `AddMapping`: route to the helper matching the endpoint kinds.
    pub async fn add_mapping(&self, scope: &Scope, request: AddMappingRequest) -> Result<Mapping> {
        self.tracked("AddMapping", async {
            let source = ResourceAddress::parse(&request.source)?;
            let target = ResourceAddress::parse(&request.target)?;
            let kinds = (ResourceKind::of(&source)?, ResourceKind::of(&target)?);
            match kinds {
                (ResourceKind::Database, ResourceKind::Database)
                | (ResourceKind::Table, ResourceKind::Table)
                | (ResourceKind::Stream, ResourceKind::Table)
                | (ResourceKind::Table, ResourceKind::Stream)
                | (ResourceKind::Stream, ResourceKind::Stream)
                | (ResourceKind::Database | ResourceKind::Table, ResourceKind::McpResource) => {
                    self.create_mapping(scope, request, kinds).await
                }
                (source_kind, target_kind) => Err(MappingError::invalid(format!(
                    "unsupported mapping from {} to {}",
                    source_kind, target_kind
                ))),
            }
        })
        .await
    }

    pub async fn add_database_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddDatabaseMapping", async {
            self.create_mapping(scope, request, (ResourceKind::Database, ResourceKind::Database))
                .await
        })
        .await
    }

    pub async fn add_table_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddTableMapping", async {
            self.create_mapping(scope, request, (ResourceKind::Table, ResourceKind::Table))
                .await
        })
        .await
    }

    pub async fn add_stream_to_table_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddStreamToTableMapping", async {
            self.create_mapping(scope, request, (ResourceKind::Stream, ResourceKind::Table))
                .await
        })
        .await
    }

    pub async fn add_table_to_stream_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddTableToStreamMapping", async {
            self.create_mapping(scope, request, (ResourceKind::Table, ResourceKind::Stream))
                .await
        })
        .await
    }

    pub async fn add_stream_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddStreamMapping", async {
            self.create_mapping(scope, request, (ResourceKind::Stream, ResourceKind::Stream))
                .await
        })
        .await
    }

    /// A mapping whose target is an MCP resource. The source may be a
    /// database or a table.
    pub async fn add_mcp_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
    ) -> Result<Mapping> {
        self.tracked("AddMCPMapping", async {
            let source = ResourceAddress::parse(&request.source)?;
            let source_kind = match ResourceKind::of(&source)? {
                kind @ (ResourceKind::Database | ResourceKind::Table) => kind,
                other => {
                    return Err(MappingError::invalid(format!(
                        "MCP mappings need a database or table source, got {}",
                        other
                    )))
                }
            };
            self.create_mapping(scope, request, (source_kind, ResourceKind::McpResource))
                .await
        })
        .await
    }

    /// `AddTableMappingWithDeploy`: deploy a table into the target database,
    /// then map the source table onto it.
    ///
    /// A failure after the deploy is a `PartialSuccess` naming the table that
    /// now exists without a mapping.
    pub async fn add_table_mapping_with_deploy(
        &self,
        scope: &Scope,
        deploy: TableDeployRequest,
        request: AddMappingRequest,
    ) -> Result<DeployedMapping> {
        self.tracked("AddTableMappingWithDeploy", async {
            self.require_workspace(scope).await?;
            let deployed = self.deployer.deploy_table(scope, &deploy).await?;

            let request = AddMappingRequest {
                source: ResourceAddress::table(&deploy.source_database_id, &deploy.table)
                    .to_string(),
                target: ResourceAddress::table(&deployed.database_id, &deployed.table)
                    .to_string(),
                ..request
            };
            let mapping = self
                .create_mapping(scope, request, (ResourceKind::Table, ResourceKind::Table))
                .await
                .map_err(|e| {
                    MappingError::partial(
                        format!(
                            "table '{}' was deployed to database {}",
                            deployed.table, deployed.database_id
                        ),
                        e,
                    )
                })?;
            Ok(DeployedMapping { deployed, mapping })
        })
        .await
    }

    pub async fn list_mappings(&self, scope: &Scope) -> Result<Vec<Mapping>> {
        self.tracked("ListMappings", async {
            self.require_workspace(scope).await?;
            self.store.list_mappings(scope).await
        })
        .await
    }

    pub async fn show_mapping(&self, scope: &Scope, mapping_id: &str) -> Result<MappingDetails> {
        self.tracked("ShowMapping", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let rules = attached_rules(self.store.as_ref(), scope, &mapping.id).await?;
            let filters = self.store.list_filters(&mapping.id).await?;
            Ok(MappingDetails {
                mapping,
                rules,
                filters,
            })
        })
        .await
    }

    pub async fn modify_mapping(
        &self,
        scope: &Scope,
        mapping_id: &str,
        changes: MappingChanges,
    ) -> Result<Mapping> {
        self.tracked("ModifyMapping", async {
            self.require_workspace(scope).await?;
            let current = require_mapping(self.store.as_ref(), scope, mapping_id).await?;

            let name = match changes.name {
                Some(name) if name != current.name => {
                    self.check_mapping_name(scope, &name).await?;
                    name
                }
                _ => current.name,
            };
            let description = changes.description.unwrap_or(current.description);
            let mapping = self
                .store
                .update_mapping_details(scope, &current.id, &name, &description)
                .await?;

            let mut outbox = Outbox::default();
            outbox.push(MAPPINGS, BroadcastOperation::Update, &mapping.id, &mapping);
            outbox.send(&self.broadcaster);
            Ok(mapping)
        })
        .await
    }

    /// Delete a mapping. Unless `keep_rules` is set, its rules that no other
    /// mapping references are deleted too. Returns how many rules went.
    pub async fn delete_mapping(
        &self,
        scope: &Scope,
        mapping_id: &str,
        keep_rules: bool,
    ) -> Result<usize> {
        self.tracked("DeleteMapping", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let links = self.store.mapping_links(&mapping.id).await?;
            self.store.delete_mapping(scope, &mapping.id).await?;

            let mut outbox = Outbox::default();
            outbox.push(MAPPINGS, BroadcastOperation::Delete, &mapping.id, &mapping);

            let mut deleted = 0;
            if !keep_rules {
                for link in &links {
                    if !self.store.mappings_for_rule(&link.rule_id).await?.is_empty() {
                        continue;
                    }
                    if self.store.delete_rule(scope, &link.rule_id).await? {
                        outbox.push(
                            RULES,
                            BroadcastOperation::Delete,
                            &link.rule_id,
                            &serde_json::json!({ "id": link.rule_id }),
                        );
                        deleted += 1;
                    }
                }
            }
            outbox.send(&self.broadcaster);

            info!(
                "Deleted mapping '{}' ({} of {} rules deleted)",
                mapping.name,
                deleted,
                links.len()
            );
            Ok(deleted)
        })
        .await
    }

    /// Create a mapping with the given endpoint kinds, then optionally
    /// generate its rules from a schema match.
    async fn create_mapping(
        &self,
        scope: &Scope,
        request: AddMappingRequest,
        (source_kind, target_kind): (ResourceKind, ResourceKind),
    ) -> Result<Mapping> {
        self.require_workspace(scope).await?;
        if request.name.trim().is_empty() {
            return Err(MappingError::invalid("mapping name is required"));
        }
        self.check_mapping_name(scope, &request.name).await?;

        let source = self
            .parse_endpoint(scope, &request.source, source_kind, "source")
            .await?;
        let target = self
            .parse_endpoint(scope, &request.target, target_kind, "target")
            .await?;

        let mut provenance = Map::new();
        let source_container_id = self
            .resolve_endpoint(scope, &source, "source", &mut provenance)
            .await?;
        let target_container_id = self
            .resolve_endpoint(scope, &target, "target", &mut provenance)
            .await?;

        let now = Utc::now();
        let mut mapping = Mapping {
            id: Uuid::new_v4().to_string(),
            scope: scope.clone(),
            name: request.name,
            description: request.description,
            source_kind,
            target_kind,
            source: source.address,
            target: target.address,
            source_container_id,
            target_container_id,
            provenance,
            validation: ValidationState::default(),
            rule_count: 0,
            owner_id: request.owner_id,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_mapping(&mapping).await?;
        info!(
            "Created {} mapping '{}' ({})",
            mapping.mapping_type(),
            mapping.name,
            mapping.id
        );

        let mut outbox = Outbox::default();
        outbox.push(MAPPINGS, BroadcastOperation::Insert, &mapping.id, &mapping);

        if request.generate_rules && self.matcher.generate_rules(&mapping).await > 0 {
            mapping = require_mapping(self.store.as_ref(), scope, &mapping.id).await?;
            let attached = attached_rules(self.store.as_ref(), scope, &mapping.id).await?;
            for attached in &attached {
                outbox.push(RULES, BroadcastOperation::Insert, &attached.rule.id, &attached.rule);
            }
            for attached in &attached {
                outbox.push(
                    MAPPING_RULES,
                    BroadcastOperation::Insert,
                    link_key(&mapping.id, &attached.rule.id),
                    &LinkRecord {
                        mapping_id: &mapping.id,
                        rule_id: &attached.rule.id,
                        order: attached.order,
                    },
                );
            }
        }
        outbox.send(&self.broadcaster);
        Ok(mapping)
    }

    async fn check_mapping_name(&self, scope: &Scope, name: &str) -> Result<()> {
        if self.store.find_mapping_by_name(scope, name).await?.is_some() {
            return Err(MappingError::invalid(format!(
                "a mapping named '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    /// Check an endpoint exists, note readable names in `provenance`, and
    /// return the id of its discovered container if there is one.
    async fn resolve_endpoint(
        &self,
        scope: &Scope,
        resolved: &ResolvedAddress,
        role: &str,
        provenance: &mut Map<String, Value>,
    ) -> Result<Option<String>> {
        let address = &resolved.address;
        match address {
            ResourceAddress::Database { database_id }
            | ResourceAddress::Table { database_id, .. } => {
                if let Some(name) = &resolved.database_name {
                    provenance.insert(
                        format!("{}_database_name", role),
                        Value::String(name.clone()),
                    );
                }

                let Some(table) = address.table_name() else {
                    return Ok(None);
                };
                let database = self
                    .store
                    .get_database(scope, database_id)
                    .await?
                    .ok_or_else(|| MappingError::not_found("database", database_id.as_str()))?;
                if let Some(schema) = &database.schema {
                    if !schema.has_table(table) {
                        return Err(MappingError::not_found(
                            "table",
                            format!("{}.{}", database_id, table),
                        ));
                    }
                }
                provenance.insert(format!("{}_table", role), Value::String(table.to_string()));
                self.container_id(address).await
            }
            ResourceAddress::Stream(stream) => {
                provenance.insert(
                    format!("{}_integration", role),
                    Value::String(stream.integration.clone()),
                );
                provenance.insert(
                    format!("{}_topic", role),
                    Value::String(stream.topic.clone()),
                );
                self.container_id(address).await
            }
            ResourceAddress::Mcp { resource } => {
                provenance.insert(
                    format!("{}_resource", role),
                    Value::String(resource.clone()),
                );
                Ok(None)
            }
            ResourceAddress::Column { .. } => Err(MappingError::invalid(format!(
                "{} '{}' is a column; mappings connect larger resources",
                role, address
            ))),
        }
    }

    async fn container_id(&self, address: &ResourceAddress) -> Result<Option<String>> {
        let container = self.store.find_container(address).await?;
        if container.is_none() {
            debug!("{} has not been discovered yet", address);
        }
        Ok(container.map(|c| c.id))
    }

    /// Resolve an endpoint address and check it has the kind the RPC expects.
    async fn parse_endpoint(
        &self,
        scope: &Scope,
        input: &str,
        expected: ResourceKind,
        role: &str,
    ) -> Result<ResolvedAddress> {
        let kind = ResourceKind::of(&ResourceAddress::parse(input)?)?;
        if kind != expected {
            return Err(MappingError::invalid(format!(
                "{} '{}' is a {} address, expected a {} address",
                role, input, kind, expected
            )));
        }
        self.resolve_address(scope, input).await
    }
}
