//! In-memory mapping store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{MappingStore, RuleLink};
use crate::core::{
    CommitSchema, DatabaseRecord, Mapping, MappingFilter, ResourceAddress, ResourceContainer,
    ResourceItem, Rule, Scope, ValidationState,
};
use crate::error::{MappingError, Result};

type CommitKey = (Scope, String, String, String);

#[derive(Default)]
struct Inner {
    workspaces: HashSet<Scope>,
    databases: HashMap<String, DatabaseRecord>,
    containers: HashMap<String, ResourceContainer>,
    items: HashMap<String, Vec<ResourceItem>>,
    commits: HashMap<CommitKey, CommitSchema>,
    mappings: HashMap<String, Mapping>,
    rules: HashMap<String, Rule>,
    links: Vec<RuleLink>,
    filters: Vec<MappingFilter>,
    #[cfg(test)]
    rule_insert_budget: Option<usize>,
}

impl Inner {
    /// Recompute the denormalized rule count and clear the validity flag.
    fn touch_mapping(&mut self, mapping_id: &str) {
        let count = self
            .links
            .iter()
            .filter(|l| l.mapping_id == mapping_id)
            .count();
        if let Some(mapping) = self.mappings.get_mut(mapping_id) {
            mapping.rule_count = count;
            mapping.invalidate();
        }
    }

    fn mapping_mut(&mut self, mapping_id: &str) -> Result<&mut Mapping> {
        self.mappings
            .get_mut(mapping_id)
            .ok_or_else(|| MappingError::not_found("mapping", mapping_id))
    }
}

/// Mapping store holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` more rule inserts, then fail every later one.
    #[cfg(test)]
    pub(crate) async fn fail_rule_inserts_after(&self, n: usize) {
        self.inner.write().await.rule_insert_budget = Some(n);
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn workspace_exists(&self, scope: &Scope) -> Result<bool> {
        Ok(self.inner.read().await.workspaces.contains(scope))
    }

    async fn put_workspace(&self, scope: &Scope) -> Result<()> {
        self.inner.write().await.workspaces.insert(scope.clone());
        Ok(())
    }

    async fn get_database(
        &self,
        scope: &Scope,
        database_id: &str,
    ) -> Result<Option<DatabaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .databases
            .get(database_id)
            .filter(|db| &db.scope == scope)
            .cloned())
    }

    async fn put_database(&self, database: &DatabaseRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .databases
            .insert(database.id.clone(), database.clone());
        Ok(())
    }

    async fn upsert_container(
        &self,
        container: &ResourceContainer,
        items: &[ResourceItem],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .containers
            .insert(container.id.clone(), container.clone());
        inner.items.insert(container.id.clone(), items.to_vec());
        Ok(())
    }

    async fn find_container(
        &self,
        address: &ResourceAddress,
    ) -> Result<Option<ResourceContainer>> {
        let inner = self.inner.read().await;
        Ok(inner
            .containers
            .values()
            .find(|c| &c.address == address)
            .cloned())
    }

    async fn list_items(&self, container_id: &str) -> Result<Vec<ResourceItem>> {
        let inner = self.inner.read().await;
        Ok(inner.items.get(container_id).cloned().unwrap_or_default())
    }

    async fn put_commit_schema(&self, scope: &Scope, commit: &CommitSchema) -> Result<()> {
        let key = (
            scope.clone(),
            commit.repo.clone(),
            commit.branch.clone(),
            commit.commit.clone(),
        );
        self.inner.write().await.commits.insert(key, commit.clone());
        Ok(())
    }

    async fn get_commit_schema(
        &self,
        scope: &Scope,
        repo: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Option<CommitSchema>> {
        let key = (
            scope.clone(),
            repo.to_string(),
            branch.to_string(),
            commit.to_string(),
        );
        Ok(self.inner.read().await.commits.get(&key).cloned())
    }

    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.mappings.contains_key(&mapping.id) {
            return Err(MappingError::internal(format!(
                "mapping id {} already exists",
                mapping.id
            )));
        }
        inner.mappings.insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn update_mapping_details(
        &self,
        scope: &Scope,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Mapping> {
        let mut inner = self.inner.write().await;
        let mapping = inner.mapping_mut(id)?;
        if &mapping.scope != scope {
            return Err(MappingError::not_found("mapping", id));
        }
        mapping.name = name.to_string();
        mapping.description = description.to_string();
        mapping.updated_at = Utc::now();
        Ok(mapping.clone())
    }

    async fn get_mapping(&self, scope: &Scope, id: &str) -> Result<Option<Mapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mappings
            .get(id)
            .filter(|m| &m.scope == scope)
            .cloned())
    }

    async fn find_mapping_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Mapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mappings
            .values()
            .find(|m| &m.scope == scope && m.name == name)
            .cloned())
    }

    async fn list_mappings(&self, scope: &Scope) -> Result<Vec<Mapping>> {
        let inner = self.inner.read().await;
        let mut mappings: Vec<Mapping> = inner
            .mappings
            .values()
            .filter(|m| &m.scope == scope)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(mappings)
    }

    async fn delete_mapping(&self, scope: &Scope, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let owned = inner.mappings.get(id).is_some_and(|m| &m.scope == scope);
        if !owned {
            return Ok(false);
        }
        inner.mappings.remove(id);
        inner.links.retain(|l| l.mapping_id != id);
        inner.filters.retain(|f| f.mapping_id != id);
        Ok(true)
    }

    async fn record_validation(&self, mapping_id: &str, state: &ValidationState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mapping = inner.mapping_mut(mapping_id)?;
        mapping.validation = state.clone();
        mapping.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let mut inner = self.inner.write().await;
        #[cfg(test)]
        if let Some(budget) = inner.rule_insert_budget.as_mut() {
            if *budget == 0 {
                return Err(MappingError::unavailable("store", "rule insert refused"));
            }
            *budget -= 1;
        }
        if inner.rules.contains_key(&rule.id) {
            return Err(MappingError::internal(format!(
                "rule id {} already exists",
                rule.id
            )));
        }
        inner.rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .rules
            .get_mut(&rule.id)
            .ok_or_else(|| MappingError::not_found("rule", rule.id.clone()))?;
        *stored = rule.clone();
        Ok(())
    }

    async fn get_rule(&self, scope: &Scope, id: &str) -> Result<Option<Rule>> {
        let inner = self.inner.read().await;
        Ok(inner.rules.get(id).filter(|r| &r.scope == scope).cloned())
    }

    async fn find_rule_by_name(&self, scope: &Scope, name: &str) -> Result<Option<Rule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .values()
            .find(|r| &r.scope == scope && r.name == name)
            .cloned())
    }

    async fn list_rules(&self, scope: &Scope) -> Result<Vec<Rule>> {
        let inner = self.inner.read().await;
        let mut rules: Vec<Rule> = inner
            .rules
            .values()
            .filter(|r| &r.scope == scope)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(rules)
    }

    async fn delete_rule(&self, scope: &Scope, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let owned = inner.rules.get(id).is_some_and(|r| &r.scope == scope);
        if !owned {
            return Ok(false);
        }
        inner.rules.remove(id);

        let affected: Vec<String> = inner
            .links
            .iter()
            .filter(|l| l.rule_id == id)
            .map(|l| l.mapping_id.clone())
            .collect();
        inner.links.retain(|l| l.rule_id != id);
        for mapping_id in affected {
            inner.touch_mapping(&mapping_id);
        }
        Ok(true)
    }

    async fn attach_rule(
        &self,
        mapping_id: &str,
        rule_id: &str,
        order: Option<i32>,
    ) -> Result<i32> {
        let mut inner = self.inner.write().await;
        inner.mapping_mut(mapping_id)?;
        if !inner.rules.contains_key(rule_id) {
            return Err(MappingError::not_found("rule", rule_id));
        }

        let order = order.unwrap_or_else(|| {
            inner
                .links
                .iter()
                .filter(|l| l.mapping_id == mapping_id)
                .map(|l| l.order + 1)
                .max()
                .unwrap_or(0)
        });

        let existing = inner
            .links
            .iter()
            .position(|l| l.mapping_id == mapping_id && l.rule_id == rule_id);
        match existing {
            Some(i) => inner.links[i].order = order,
            None => inner.links.push(RuleLink {
                mapping_id: mapping_id.to_string(),
                rule_id: rule_id.to_string(),
                order,
            }),
        }
        inner.touch_mapping(mapping_id);
        Ok(order)
    }

    async fn detach_rule(&self, mapping_id: &str, rule_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.links.len();
        inner
            .links
            .retain(|l| !(l.mapping_id == mapping_id && l.rule_id == rule_id));
        let removed = inner.links.len() != before;
        if removed {
            inner.touch_mapping(mapping_id);
        }
        Ok(removed)
    }

    async fn mapping_links(&self, mapping_id: &str) -> Result<Vec<RuleLink>> {
        let inner = self.inner.read().await;
        let mut links: Vec<RuleLink> = inner
            .links
            .iter()
            .filter(|l| l.mapping_id == mapping_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.order);
        Ok(links)
    }

    async fn mappings_for_rule(&self, rule_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .map(|l| l.mapping_id.clone())
            .collect())
    }

    async fn invalidate_mappings_for_rule(&self, rule_id: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let affected: Vec<String> = inner
            .links
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .map(|l| l.mapping_id.clone())
            .collect();
        for mapping_id in &affected {
            if let Some(mapping) = inner.mappings.get_mut(mapping_id) {
                mapping.invalidate();
            }
        }
        Ok(affected.len())
    }

    async fn add_filter(&self, filter: &MappingFilter) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.mapping_mut(&filter.mapping_id)?.invalidate();
        inner.filters.push(filter.clone());
        Ok(())
    }

    async fn remove_filter(&self, mapping_id: &str, filter_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.filters.len();
        inner
            .filters
            .retain(|f| !(f.mapping_id == mapping_id && f.id == filter_id));
        let removed = inner.filters.len() != before;
        if removed {
            inner.mapping_mut(mapping_id)?.invalidate();
        }
        Ok(removed)
    }

    async fn list_filters(&self, mapping_id: &str) -> Result<Vec<MappingFilter>> {
        let inner = self.inner.read().await;
        let mut filters: Vec<MappingFilter> = inner
            .filters
            .iter()
            .filter(|f| f.mapping_id == mapping_id)
            .cloned()
            .collect();
        filters.sort_by_key(|f| f.order);
        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_mapping, sample_rule, scope};

    #[tokio::test]
    async fn test_attach_appends_and_invalidates() {
        let store = MemoryStore::new();
        let mut mapping = sample_mapping("m1", "orders");
        mapping.validation.validated = true;
        store.insert_mapping(&mapping).await.unwrap();
        store.insert_rule(&sample_rule("r1", "a")).await.unwrap();
        store.insert_rule(&sample_rule("r2", "b")).await.unwrap();

        assert_eq!(store.attach_rule("m1", "r1", None).await.unwrap(), 0);
        assert_eq!(store.attach_rule("m1", "r2", None).await.unwrap(), 1);

        let stored = store.get_mapping(&scope(), "m1").await.unwrap().unwrap();
        assert_eq!(stored.rule_count, 2);
        assert!(!stored.is_validated());

        let links = store.mapping_links("m1").await.unwrap();
        let ids: Vec<_> = links.iter().map(|l| l.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_attach_unknown_rule() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&sample_mapping("m1", "orders"))
            .await
            .unwrap();
        let err = store.attach_rule("m1", "nope", None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_delete_rule_detaches_everywhere() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&sample_mapping("m1", "one"))
            .await
            .unwrap();
        store
            .insert_mapping(&sample_mapping("m2", "two"))
            .await
            .unwrap();
        store.insert_rule(&sample_rule("r1", "shared")).await.unwrap();
        store.attach_rule("m1", "r1", None).await.unwrap();
        store.attach_rule("m2", "r1", Some(5)).await.unwrap();

        assert_eq!(store.mappings_for_rule("r1").await.unwrap().len(), 2);
        assert!(store.delete_rule(&scope(), "r1").await.unwrap());
        assert!(store.mappings_for_rule("r1").await.unwrap().is_empty());

        let m2 = store.get_mapping(&scope(), "m2").await.unwrap().unwrap();
        assert_eq!(m2.rule_count, 0);
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&sample_mapping("m1", "orders"))
            .await
            .unwrap();
        let other = Scope::new("other-tenant", "ws");
        assert!(store.get_mapping(&other, "m1").await.unwrap().is_none());
        assert!(!store.delete_mapping(&other, "m1").await.unwrap());
        assert!(store.list_mappings(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_details_update_keeps_concurrent_changes() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&sample_mapping("m1", "orders"))
            .await
            .unwrap();
        let stale = store.get_mapping(&scope(), "m1").await.unwrap().unwrap();

        store.insert_rule(&sample_rule("r1", "a")).await.unwrap();
        store.attach_rule("m1", "r1", None).await.unwrap();
        let validated = ValidationState {
            validated: true,
            validated_at: Some(Utc::now()),
            ..Default::default()
        };
        store.record_validation("m1", &validated).await.unwrap();

        let updated = store
            .update_mapping_details(&scope(), &stale.id, "orders-v2", "renamed")
            .await
            .unwrap();
        assert_eq!(updated.name, "orders-v2");
        assert_eq!(updated.description, "renamed");
        assert_eq!(updated.rule_count, 1);
        assert!(updated.validation.validated);

        let other = Scope::new("other-tenant", "ws");
        let err = store
            .update_mapping_details(&other, "m1", "x", "")
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_filters_are_ordered() {
        use crate::core::{FilterOperator, FilterType};
        use serde_json::Map;

        let store = MemoryStore::new();
        store
            .insert_mapping(&sample_mapping("m1", "orders"))
            .await
            .unwrap();
        for (id, order) in [("f2", 2), ("f1", 1)] {
            store
                .add_filter(&MappingFilter {
                    id: id.into(),
                    mapping_id: "m1".into(),
                    filter_type: FilterType::Custom,
                    expression: Map::new(),
                    order,
                    operator: FilterOperator::And,
                })
                .await
                .unwrap();
        }
        let ids: Vec<_> = store
            .list_filters("m1")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert!(store.remove_filter("m1", "f1").await.unwrap());
        assert!(!store.remove_filter("m1", "f1").await.unwrap());
    }
}
