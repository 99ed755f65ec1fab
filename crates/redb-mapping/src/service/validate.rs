//! `ValidateMapping` and the unmapped-columns view.

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::MappingService;
use crate::core::{
    validate_cardinality, validate_filter, AttachedRule, Mapping, ResourceAddress, ResourceItem,
    Rule, Scope, ValidationState,
};
use crate::error::{MappingError, Result};
use crate::store::{attached_rules, require_mapping};

/// Outcome of `ValidateMapping`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MappingService {
    /// Check every rule and filter of a mapping, collecting all findings, and
    /// store the outcome on the mapping.
    pub async fn validate_mapping(&self, scope: &Scope, mapping_id: &str) -> Result<ValidationReport> {
        self.tracked("ValidateMapping", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let rules = attached_rules(self.store.as_ref(), scope, &mapping.id).await?;

            let mut report = ValidationReport::default();
            if rules.is_empty() {
                report.errors.push("mapping has no rules".to_string());
            }
            for AttachedRule { rule, .. } in &rules {
                self.check_rule(&mapping, rule, &mut report).await;
            }

            let filters = self.store.list_filters(&mapping.id).await?;
            for filter in &filters {
                if let Err(e) = validate_filter(filter.filter_type.as_str(), &filter.expression) {
                    report
                        .warnings
                        .push(format!("filter {}: {}", filter.id, e));
                }
            }
            let operators: HashSet<_> = filters.iter().map(|f| f.operator).collect();
            if operators.len() > 1 {
                report
                    .warnings
                    .push("filters mix AND and OR operators".to_string());
            }

            let unmapped = self.unmapped_items(&mapping, &rules).await?;
            if !unmapped.is_empty() {
                let names: Vec<String> = unmapped.iter().map(|i| i.address.to_string()).collect();
                report.warnings.push(format!(
                    "{} target columns are not mapped: {}",
                    names.len(),
                    names.join(", ")
                ));
            }

            report.is_valid = report.errors.is_empty();
            let state = ValidationState {
                validated: report.is_valid,
                validated_at: Some(Utc::now()),
                errors: report.errors.clone(),
                warnings: report.warnings.clone(),
            };
            self.store.record_validation(&mapping.id, &state).await?;
            info!(
                "Validated mapping '{}': {} errors, {} warnings",
                mapping.name,
                report.errors.len(),
                report.warnings.len()
            );
            Ok(report)
        })
        .await
    }

    /// Items of the mapping's target containers that no rule writes to.
    pub async fn unmapped_columns(
        &self,
        scope: &Scope,
        mapping_id: &str,
    ) -> Result<Vec<ResourceItem>> {
        self.tracked("GetUnmappedColumns", async {
            self.require_workspace(scope).await?;
            let mapping = require_mapping(self.store.as_ref(), scope, mapping_id).await?;
            let rules = attached_rules(self.store.as_ref(), scope, &mapping.id).await?;
            self.unmapped_items(&mapping, &rules).await
        })
        .await
    }

    async fn check_rule(&self, mapping: &Mapping, rule: &Rule, report: &mut ValidationReport) {
        let label = format!("rule '{}'", rule.name);

        for item in rule.source_items.iter().chain(&rule.target_items) {
            if let Err(e) = reparse(item) {
                report.errors.push(format!("{}: {}", label, e));
            }
        }

        let counts = (rule.source_items.len(), rule.target_items.len());
        if let Err(e) = validate_cardinality(rule.cardinality.as_str(), counts.0, counts.1) {
            report.errors.push(format!("{}: {}", label, e));
        }
        if let Err(e) = self
            .check_transformation(&rule.transformation, rule.cardinality)
            .await
        {
            report.errors.push(format!("{}: {}", label, e));
        }

        for (items, endpoint, side) in [
            (&rule.source_items, &mapping.source, "source"),
            (&rule.target_items, &mapping.target, "target"),
        ] {
            for item in items.iter().filter(|i| !i.is_within(endpoint)) {
                report.warnings.push(format!(
                    "{}: {} item {} lies outside mapping {} {}",
                    label, side, item, side, endpoint
                ));
            }
        }
    }

    /// Target containers are the mapping target itself when it is a table or
    /// stream, otherwise every table the rules write to.
    async fn unmapped_items(
        &self,
        mapping: &Mapping,
        rules: &[AttachedRule],
    ) -> Result<Vec<ResourceItem>> {
        let mapped: HashSet<&ResourceAddress> =
            rules.iter().flat_map(|r| &r.rule.target_items).collect();

        let containers: Vec<ResourceAddress> = match &mapping.target {
            ResourceAddress::Table { .. } | ResourceAddress::Stream(_) => {
                vec![mapping.target.clone()]
            }
            ResourceAddress::Database { .. } => {
                let mut seen = HashSet::new();
                mapped
                    .iter()
                    .map(|item| item.container())
                    .filter(|c| seen.insert(c.clone()))
                    .collect()
            }
            _ => Vec::new(),
        };

        let mut unmapped = Vec::new();
        for address in &containers {
            let Some(container) = self.store.find_container(address).await? else {
                continue;
            };
            unmapped.extend(
                self.store
                    .list_items(&container.id)
                    .await?
                    .into_iter()
                    .filter(|item| !mapped.contains(&item.address)),
            );
        }
        Ok(unmapped)
    }
}

/// An address must read back as itself, otherwise it cannot be stored.
fn reparse(address: &ResourceAddress) -> Result<()> {
    let text = address.to_string();
    let parsed = ResourceAddress::parse(&text)?;
    if &parsed != address {
        return Err(MappingError::invalid(format!(
            "address '{}' does not parse back to the same resource",
            text
        )));
    }
    Ok(())
}
