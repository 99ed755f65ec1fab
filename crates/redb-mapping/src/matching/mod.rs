//! Schema-match driven rule generation.
//!
//! The orchestrator sends the discovered schemas of a mapping's source and
//! target (with column enrichment from discovered resource items) to the
//! unified-model service, then turns every accepted column match into a
//! `direct_mapping` rule attached to the mapping.
//!
//! Generation is best-effort: any failure is logged and yields fewer (or no)
//! rules, never a failed mapping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    Cardinality, ColumnEnrichment, ColumnMatch, EnrichedSchema, Mapping, MatchOptions,
    MatchRequest, Provenance, ResourceAddress, Rule, RuleMetadata, SchemaModel,
    TableEnrichment, UnifiedModelService, DIRECT_MAPPING,
};
use crate::error::{MappingError, Result};
use crate::store::MappingStore;

const GENERATION_METHOD: &str = "schema_match";

/// One side of a match: a database schema, optionally narrowed to a table.
struct MatchSide {
    database_id: String,
    schema: SchemaModel,
}

pub struct MatchOrchestrator {
    store: Arc<dyn MappingStore>,
    matcher: Arc<dyn UnifiedModelService>,
    options: MatchOptions,
}

impl MatchOrchestrator {
    pub fn new(
        store: Arc<dyn MappingStore>,
        matcher: Arc<dyn UnifiedModelService>,
        options: MatchOptions,
    ) -> Self {
        Self {
            store,
            matcher,
            options,
        }
    }

    /// Generate and attach rules for `mapping`. Returns how many were
    /// attached, including those attached before a failure.
    pub async fn generate_rules(&self, mapping: &Mapping) -> usize {
        let mut attached = 0;
        match self.try_generate(mapping, &mut attached).await {
            Ok(()) => info!(
                "Generated {} rules for mapping '{}' from schema match",
                attached, mapping.name
            ),
            Err(e) => warn!(
                "Rule generation for mapping '{}' stopped after {} rules: {}",
                mapping.name, attached, e
            ),
        }
        attached
    }

    async fn try_generate(&self, mapping: &Mapping, attached: &mut usize) -> Result<()> {
        let (Some(source), Some(target)) = (
            self.side(mapping, &mapping.source).await?,
            self.side(mapping, &mapping.target).await?,
        ) else {
            debug!(
                "Mapping '{}' is {}, nothing to match",
                mapping.name,
                mapping.mapping_type()
            );
            return Ok(());
        };

        let request = MatchRequest {
            source: self.enrich(&source).await?,
            target: self.enrich(&target).await?,
            options: self.options.clone(),
        };
        let result = self.matcher.match_schemas(request).await?;
        debug!(
            "Schema match for '{}': {} table matches, overall similarity {:.2}",
            mapping.name,
            result.table_matches.len(),
            result.overall_similarity
        );

        let mut used_names = HashSet::new();
        for column in result
            .table_matches
            .iter()
            .flat_map(|t| t.column_matches.iter())
            .filter(|c| self.accepts(c))
        {
            let rule = self
                .build_rule(mapping, &source, &target, column, &mut used_names)
                .await?;
            self.store.insert_rule(&rule).await?;
            self.store.attach_rule(&mapping.id, &rule.id, None).await?;
            *attached += 1;
        }

        Ok(())
    }

    fn accepts(&self, column: &ColumnMatch) -> bool {
        column.score >= self.options.acceptance_threshold
            && !column.is_poor_match
            && !column.is_unmatched
    }

    /// Database schema behind a mapping endpoint. `None` for MCP and stream
    /// endpoints, which have no schema to match.
    async fn side(&self, mapping: &Mapping, address: &ResourceAddress) -> Result<Option<MatchSide>> {
        let Some(database_id) = address.database_id() else {
            return Ok(None);
        };
        let database = self
            .store
            .get_database(&mapping.scope, database_id)
            .await?
            .ok_or_else(|| MappingError::not_found("database", database_id))?;
        let schema = database.require_schema()?;
        let schema = match address.table_name() {
            Some(table) => schema.filter_to_table(table)?,
            None => schema.clone(),
        };
        Ok(Some(MatchSide {
            database_id: database_id.to_string(),
            schema,
        }))
    }

    async fn enrich(&self, side: &MatchSide) -> Result<EnrichedSchema> {
        let mut enrichment = HashMap::new();
        for table in &side.schema.tables {
            let address = ResourceAddress::table(&side.database_id, &table.name);
            let Some(container) = self.store.find_container(&address).await? else {
                continue;
            };
            let columns = self
                .store
                .list_items(&container.id)
                .await?
                .into_iter()
                .map(|item| {
                    let enrichment = ColumnEnrichment {
                        classification: item.classification,
                        privileged: item.privileged.is_some(),
                        privileged_category: item.privileged.as_ref().map(|p| p.category.clone()),
                        confidence: item.privileged.as_ref().map(|p| p.confidence),
                    };
                    (item.name, enrichment)
                })
                .collect();
            enrichment.insert(
                table.name.clone(),
                TableEnrichment {
                    classification: None,
                    estimated_rows: container.estimated_rows.or(table.estimated_rows),
                    columns,
                },
            );
        }
        Ok(EnrichedSchema {
            schema: side.schema.clone(),
            enrichment,
        })
    }

    async fn build_rule(
        &self,
        mapping: &Mapping,
        source: &MatchSide,
        target: &MatchSide,
        column: &ColumnMatch,
        used_names: &mut HashSet<String>,
    ) -> Result<Rule> {
        let base = format!(
            "{}_{}_to_{}_{}",
            column.source_table, column.source_column, column.target_table, column.target_column
        );
        let name = self.unique_name(mapping, &base, used_names).await?;
        let now = Utc::now();

        Ok(Rule {
            id: Uuid::new_v4().to_string(),
            scope: mapping.scope.clone(),
            name,
            description: format!(
                "Auto-generated from schema match (score {:.2})",
                column.score
            ),
            cardinality: Cardinality::OneToOne,
            source_items: vec![ResourceAddress::column(
                &source.database_id,
                &column.source_table,
                &column.source_column,
            )],
            target_items: vec![ResourceAddress::column(
                &target.database_id,
                &column.target_table,
                &column.target_column,
            )],
            transformation: DIRECT_MAPPING.to_string(),
            options: Default::default(),
            metadata: RuleMetadata {
                provenance: Provenance::AutoGenerated,
                match_score: Some(column.score),
                type_compatible: Some(column.type_compatible),
                source_table: Some(column.source_table.clone()),
                source_column: Some(column.source_column.clone()),
                target_table: Some(column.target_table.clone()),
                target_column: Some(column.target_column.clone()),
                generation_method: Some(GENERATION_METHOD.to_string()),
                extra: Default::default(),
            },
            owner_id: mapping.owner_id.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// `base`, or `base_N` with the first free N.
    async fn unique_name(
        &self,
        mapping: &Mapping,
        base: &str,
        used_names: &mut HashSet<String>,
    ) -> Result<String> {
        let mut candidate = base.to_string();
        let mut counter = 0;
        loop {
            if !used_names.contains(&candidate)
                && self
                    .store
                    .find_rule_by_name(&mapping.scope, &candidate)
                    .await?
                    .is_none()
            {
                used_names.insert(candidate.clone());
                return Ok(candidate);
            }
            counter += 1;
            candidate = format!("{}_{}", base, counter);
        }
    }
}
