//! Rule RPCs and mapping filters.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::{
    link_key, LinkRecord, MappingService, Outbox, MAPPING_FILTERS, MAPPING_RULES, RULES,
};
use crate::core::{
    validate_cardinality, validate_filter, validate_filter_operator,
    validate_transformation_cardinality, AttachedRule, BroadcastOperation, Cardinality,
    MappingFilter, ResourceAddress, Rule, RuleMetadata, Scope, TransformationType, DIRECT_MAPPING,
};
use crate::error::{MappingError, Result};
use crate::store::{attached_rules, require_mapping, require_rule};

/// Request to create a rule.
#[derive(Debug, Clone, Default)]
pub struct AddRuleRequest {
    pub name: String,
    pub description: String,
    pub source_items: Vec<String>,
    pub target_items: Vec<String>,
    /// Claimed cardinality label. Inferred from the item counts when absent.
    pub cardinality: Option<String>,
    /// Defaults to `direct_mapping`.
    pub transformation: Option<String>,
    pub options: BTreeMap<String, String>,
    pub metadata: Map<String, Value>,
    pub owner_id: String,
}

/// Partial update of a rule. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct RuleChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_items: Option<Vec<String>>,
    pub target_items: Option<Vec<String>>,
    pub cardinality: Option<String>,
    pub transformation: Option<String>,
    pub options: Option<BTreeMap<String, String>>,
    pub metadata: Option<Map<String, Value>>,
}

impl MappingService {
    /// `AddMappingRule`: validate and store a rule. The rule is not attached
    /// to any mapping yet.
    pub async fn add_mapping_rule(&self, scope: &Scope, request: AddRuleRequest) -> Result<Rule> {
        self.tracked("AddMappingRule", async {
            self.require_workspace(scope).await?;
            if request.name.trim().is_empty() {
                return Err(MappingError::invalid("rule name is required"));
            }
            self.check_rule_name(scope, &request.name).await?;

            let source_items = self.resolve_items(scope, &request.source_items, "source").await?;
            let target_items = self.resolve_items(scope, &request.target_items, "target").await?;
            let cardinality = resolve_cardinality(
                request.cardinality.as_deref(),
                source_items.len(),
                target_items.len(),
            )?;
            let transformation = request
                .transformation
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DIRECT_MAPPING.to_string());
            self.check_transformation(&transformation, cardinality)
                .await?;

            let now = Utc::now();
            let rule = Rule {
                id: Uuid::new_v4().to_string(),
                scope: scope.clone(),
                name: request.name,
                description: request.description,
                cardinality,
                source_items,
                target_items,
                transformation,
                options: request.options,
                metadata: RuleMetadata::from_map(request.metadata)?,
                owner_id: request.owner_id,
                created_at: now,
                updated_at: now,
            };
            self.store.insert_rule(&rule).await?;
            info!(
                "Created {} rule '{}' using {}",
                rule.cardinality, rule.name, rule.transformation
            );

            let mut outbox = Outbox::default();
            outbox.push(RULES, BroadcastOperation::Insert, &rule.id, &rule);
            outbox.send(&self.broadcaster);
            Ok(rule)
        })
        .await
    }

    /// `AttachMappingRule`. Returns the order the rule was attached at.
    pub async fn attach_mapping_rule(
        &self,
        scope: &Scope,
        mapping_id: &str,
        rule_id: &str,
        order: Option<i32>,
    ) -> Result<i32> {
        self.tracked("AttachMappingRule", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let rule = require_rule(self.store.as_ref(), scope, rule_id).await?;
            let order = self.store.attach_rule(&mapping.id, &rule.id, order).await?;
            info!(
                "Attached rule '{}' to mapping '{}' at {}",
                rule.name, mapping.name, order
            );

            let mut outbox = Outbox::default();
            outbox.push(
                MAPPING_RULES,
                BroadcastOperation::Insert,
                link_key(&mapping.id, &rule.id),
                &LinkRecord {
                    mapping_id: &mapping.id,
                    rule_id: &rule.id,
                    order,
                },
            );
            outbox.send(&self.broadcaster);
            Ok(order)
        })
        .await
    }

    /// `DetachMappingRule`. The rule itself stays.
    pub async fn detach_mapping_rule(
        &self,
        scope: &Scope,
        mapping_id: &str,
        rule_id: &str,
    ) -> Result<()> {
        self.tracked("DetachMappingRule", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            if !self.store.detach_rule(&mapping.id, rule_id).await? {
                return Err(MappingError::not_found(
                    "mapping rule",
                    link_key(&mapping.id, rule_id),
                ));
            }
            info!("Detached rule {} from mapping '{}'", rule_id, mapping.name);

            let mut outbox = Outbox::default();
            outbox.push(
                MAPPING_RULES,
                BroadcastOperation::Delete,
                link_key(&mapping.id, rule_id),
                &serde_json::json!({ "mapping_id": mapping.id, "rule_id": rule_id }),
            );
            outbox.send(&self.broadcaster);
            Ok(())
        })
        .await
    }

    pub async fn list_mapping_rules(
        &self,
        scope: &Scope,
        mapping_id: &str,
    ) -> Result<Vec<AttachedRule>> {
        self.tracked("ListMappingRules", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            attached_rules(self.store.as_ref(), scope, &mapping.id).await
        })
        .await
    }

    /// `ModifyMappingRule`: re-validates the result as a whole and
    /// invalidates every mapping using the rule.
    pub async fn modify_mapping_rule(
        &self,
        scope: &Scope,
        rule_id: &str,
        changes: RuleChanges,
    ) -> Result<Rule> {
        self.tracked("ModifyMappingRule", async {
            self.require_workspace(scope).await?;
            let mut rule = require_rule(self.store.as_ref(), scope, rule_id).await?;

            if let Some(name) = changes.name {
                if name != rule.name {
                    self.check_rule_name(scope, &name).await?;
                    rule.name = name;
                }
            }
            if let Some(description) = changes.description {
                rule.description = description;
            }
            let items_changed = changes.source_items.is_some() || changes.target_items.is_some();
            if let Some(items) = changes.source_items {
                rule.source_items = self.resolve_items(scope, &items, "source").await?;
            }
            if let Some(items) = changes.target_items {
                rule.target_items = self.resolve_items(scope, &items, "target").await?;
            }
            let claimed = match (changes.cardinality, items_changed) {
                (Some(label), _) => Some(label),
                (None, true) => None,
                (None, false) => Some(rule.cardinality.as_str().to_string()),
            };
            rule.cardinality = resolve_cardinality(
                claimed.as_deref(),
                rule.source_items.len(),
                rule.target_items.len(),
            )?;
            if let Some(transformation) = changes.transformation {
                rule.transformation = transformation;
            }
            self.check_transformation(&rule.transformation, rule.cardinality)
                .await?;
            if let Some(options) = changes.options {
                rule.options = options;
            }
            if let Some(metadata) = changes.metadata {
                rule.metadata = RuleMetadata::from_map(metadata)?;
            }
            rule.updated_at = Utc::now();

            self.store.update_rule(&rule).await?;
            let invalidated = self.store.invalidate_mappings_for_rule(&rule.id).await?;
            info!(
                "Modified rule '{}', {} mappings need validation again",
                rule.name, invalidated
            );

            let mut outbox = Outbox::default();
            outbox.push(RULES, BroadcastOperation::Update, &rule.id, &rule);
            outbox.send(&self.broadcaster);
            Ok(rule)
        })
        .await
    }

    /// `DeleteMappingRule`: detach the rule everywhere and delete it.
    pub async fn delete_mapping_rule(&self, scope: &Scope, rule_id: &str) -> Result<()> {
        self.tracked("DeleteMappingRule", async {
            self.require_workspace(scope).await?;
            let rule = require_rule(self.store.as_ref(), scope, rule_id).await?;
            let invalidated = self.store.invalidate_mappings_for_rule(&rule.id).await?;
            self.store.delete_rule(scope, &rule.id).await?;
            info!(
                "Deleted rule '{}', detached from {} mappings",
                rule.name, invalidated
            );

            let mut outbox = Outbox::default();
            outbox.push(RULES, BroadcastOperation::Delete, &rule.id, &rule);
            outbox.send(&self.broadcaster);
            Ok(())
        })
        .await
    }

    /// Add a filter after the mapping's existing ones.
    pub async fn add_mapping_filter(
        &self,
        scope: &Scope,
        mapping_id: &str,
        filter_type: &str,
        expression: Map<String, Value>,
        operator: &str,
    ) -> Result<MappingFilter> {
        self.tracked("AddMappingFilter", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let filter_type = validate_filter(filter_type, &expression)?;
            let operator = validate_filter_operator(operator)?;

            let order = self
                .store
                .list_filters(&mapping.id)
                .await?
                .iter()
                .map(|f| f.order + 1)
                .max()
                .unwrap_or(0);
            let filter = MappingFilter {
                id: Uuid::new_v4().to_string(),
                mapping_id: mapping.id.clone(),
                filter_type,
                expression,
                order,
                operator,
            };
            self.store.add_filter(&filter).await?;
            info!(
                "Added {} filter to mapping '{}' at {}",
                filter.filter_type.as_str(),
                mapping.name,
                order
            );

            let mut outbox = Outbox::default();
            outbox.push(MAPPING_FILTERS, BroadcastOperation::Insert, &filter.id, &filter);
            outbox.send(&self.broadcaster);
            Ok(filter)
        })
        .await
    }

    pub async fn remove_mapping_filter(
        &self,
        scope: &Scope,
        mapping_id: &str,
        filter_id: &str,
    ) -> Result<()> {
        self.tracked("RemoveMappingFilter", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            if !self.store.remove_filter(&mapping.id, filter_id).await? {
                return Err(MappingError::not_found("filter", filter_id));
            }

            let mut outbox = Outbox::default();
            outbox.push(
                MAPPING_FILTERS,
                BroadcastOperation::Delete,
                filter_id,
                &serde_json::json!({ "id": filter_id, "mapping_id": mapping.id }),
            );
            outbox.send(&self.broadcaster);
            Ok(())
        })
        .await
    }

    /// Check a transformation exists and accepts `cardinality`.
    ///
    /// `direct_mapping` is built in and behaves as a passthrough.
    pub(super) async fn check_transformation(
        &self,
        name: &str,
        cardinality: Cardinality,
    ) -> Result<()> {
        if name == DIRECT_MAPPING {
            return validate_transformation_cardinality(
                TransformationType::Passthrough.as_str(),
                cardinality,
            )
            .map_err(|e| {
                MappingError::invalid(format!("{} cannot be used here: {}", DIRECT_MAPPING, e))
            });
        }

        let info = self
            .registry
            .describe(name)
            .await?
            .ok_or_else(|| MappingError::invalid(format!("unknown transformation '{}'", name)))?;
        if !info.valid {
            return Err(MappingError::invalid(format!(
                "transformation '{}' is not valid",
                name
            )));
        }
        validate_transformation_cardinality(info.kind.as_str(), cardinality)
    }

    async fn check_rule_name(&self, scope: &Scope, name: &str) -> Result<()> {
        if self.store.find_rule_by_name(scope, name).await?.is_some() {
            return Err(MappingError::invalid(format!(
                "a rule named '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    /// Resolve rule items; items on databases outside the workspace are
    /// rejected with `NotFound`.
    async fn resolve_items(
        &self,
        scope: &Scope,
        items: &[String],
        side: &str,
    ) -> Result<Vec<ResourceAddress>> {
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            match self.resolve_address(scope, item).await {
                Ok(r) => resolved.push(r.address),
                Err(MappingError::InvalidArgument(e)) => {
                    return Err(MappingError::invalid(format!(
                        "{} item '{}': {}",
                        side, item, e
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }
}

/// Validate a claimed cardinality against the counts, or infer one.
fn resolve_cardinality(
    claimed: Option<&str>,
    source_count: usize,
    target_count: usize,
) -> Result<Cardinality> {
    match claimed.filter(|c| !c.is_empty()) {
        Some(label) => validate_cardinality(label, source_count, target_count),
        None => Cardinality::infer(source_count, target_count).ok_or_else(|| {
            MappingError::invalid("a rule needs at least one source or target item")
        }),
    }
}
