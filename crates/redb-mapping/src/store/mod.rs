//! Persistent mapping store.
//!
//! The [`MappingStore`] trait defines the interface for persisting mappings,
//! rules, their ordered associations, filters, and the discovered resources
//! rules point at. Implementations:
//!
//! - **PostgreSQL**: [`PgMappingStore`] in `db.rs`
//! - **Memory**: [`MemoryStore`] in `memory.rs` (tests and single-process embedding)
//!
//! The store is the single source of truth. Nothing above it caches entities,
//! so concurrent writers get whatever row-level guarantees the backend gives.

mod db;
mod memory;

pub use db::PgMappingStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::core::{
    AttachedRule, CommitSchema, DatabaseDirectory, DatabaseRecord, Mapping, MappingFilter, ResourceAddress,
    ResourceContainer, ResourceItem, Rule, Scope, ValidationState,
};
use crate::error::{MappingError, Result};

/// A rule id attached to a mapping at a given position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLink {
    pub mapping_id: String,
    pub rule_id: String,
    pub order: i32,
}

/// Trait for mapping persistence backends.
///
/// Link and filter mutations keep the owning mapping consistent in the same
/// write: `rule_count` is recomputed and the `validated` flag is cleared.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Initialize the storage schema. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;

    // -- tenancy and discovered resources --

    async fn workspace_exists(&self, scope: &Scope) -> Result<bool>;

    async fn put_workspace(&self, scope: &Scope) -> Result<()>;

    async fn get_database(&self, scope: &Scope, database_id: &str)
        -> Result<Option<DatabaseRecord>>;

    async fn put_database(&self, database: &DatabaseRecord) -> Result<()>;

    /// Replace a container and its items.
    async fn upsert_container(
        &self,
        container: &ResourceContainer,
        items: &[ResourceItem],
    ) -> Result<()>;

    async fn find_container(&self, address: &ResourceAddress)
        -> Result<Option<ResourceContainer>>;

    async fn list_items(&self, container_id: &str) -> Result<Vec<ResourceItem>>;

    async fn put_commit_schema(&self, scope: &Scope, commit: &CommitSchema) -> Result<()>;

    async fn get_commit_schema(
        &self,
        scope: &Scope,
        repo: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Option<CommitSchema>>;

    // -- mappings --

    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()>;

    /// Set the name and description of a mapping, leaving every other field
    /// as stored, and return the updated mapping.
    async fn update_mapping_details(
        &self,
        scope: &Scope,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Mapping>;

    async fn get_mapping(&self, scope: &Scope, id: &str) -> Result<Option<Mapping>>;

    async fn find_mapping_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Mapping>>;

    async fn list_mappings(&self, scope: &Scope) -> Result<Vec<Mapping>>;

    /// Delete a mapping with its links and filters. Rules are left alone.
    async fn delete_mapping(&self, scope: &Scope, id: &str) -> Result<bool>;

    async fn record_validation(&self, mapping_id: &str, state: &ValidationState) -> Result<()>;

    // -- rules --

    async fn insert_rule(&self, rule: &Rule) -> Result<()>;

    async fn update_rule(&self, rule: &Rule) -> Result<()>;

    async fn get_rule(&self, scope: &Scope, id: &str) -> Result<Option<Rule>>;

    async fn find_rule_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Rule>>;

    async fn list_rules(&self, scope: &Scope) -> Result<Vec<Rule>>;

    /// Delete a rule and every link to it.
    async fn delete_rule(&self, scope: &Scope, id: &str) -> Result<bool>;

    // -- associations --

    /// Attach a rule. Without an explicit order it goes after the last one.
    /// Returns the order used.
    async fn attach_rule(&self, mapping_id: &str, rule_id: &str, order: Option<i32>)
        -> Result<i32>;

    async fn detach_rule(&self, mapping_id: &str, rule_id: &str) -> Result<bool>;

    /// Links of a mapping, ascending by order.
    async fn mapping_links(&self, mapping_id: &str) -> Result<Vec<RuleLink>>;

    async fn mappings_for_rule(&self, rule_id: &str) -> Result<Vec<String>>;

    /// Clear `validated` on every mapping referencing the rule.
    async fn invalidate_mappings_for_rule(&self, rule_id: &str) -> Result<usize>;

    // -- filters --

    async fn add_filter(&self, filter: &MappingFilter) -> Result<()>;

    async fn remove_filter(&self, mapping_id: &str, filter_id: &str) -> Result<bool>;

    /// Filters of a mapping, ascending by order.
    async fn list_filters(&self, mapping_id: &str) -> Result<Vec<MappingFilter>>;
}

/// Database-name lookup over a store, bound to one scope.
pub struct ScopedDirectory<'a> {
    store: &'a dyn MappingStore,
    scope: &'a Scope,
}

impl<'a> ScopedDirectory<'a> {
    pub fn new(store: &'a dyn MappingStore, scope: &'a Scope) -> Self {
        Self { store, scope }
    }
}

#[async_trait]
impl DatabaseDirectory for ScopedDirectory<'_> {
    async fn database_name(&self, database_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_database(self.scope, database_id)
            .await?
            .map(|db| db.name))
    }
}

/// Fetch a mapping or fail with `NotFound`.
pub async fn require_mapping(store: &dyn MappingStore, scope: &Scope, id: &str) -> Result<Mapping> {
    store
        .get_mapping(scope, id)
        .await?
        .ok_or_else(|| MappingError::not_found("mapping", id))
}

/// Fetch a rule or fail with `NotFound`.
pub async fn require_rule(store: &dyn MappingStore, scope: &Scope, id: &str) -> Result<Rule> {
    store
        .get_rule(scope, id)
        .await?
        .ok_or_else(|| MappingError::not_found("rule", id))
}

/// Rules attached to a mapping, ascending by order.
pub async fn attached_rules(
    store: &dyn MappingStore,
    scope: &Scope,
    mapping_id: &str,
) -> Result<Vec<AttachedRule>> {
    let links = store.mapping_links(mapping_id).await?;
    let mut rules = Vec::with_capacity(links.len());
    for link in links {
        let rule = require_rule(store, scope, &link.rule_id).await?;
        rules.push(AttachedRule {
            order: link.order,
            rule,
        });
    }
    Ok(rules)
}
