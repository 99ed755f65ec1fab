//! Table-pair jobs: the unit of work of a copy run.
//!
//! A mapping's rules are grouped by distinct (source table, target table)
//! pair. Each pair is copied independently so that one failing pair cannot
//! abort the others.

use std::fmt;

use tracing::warn;

use crate::core::{ResourceAddress, Rule};
use crate::error::{MappingError, Result};

/// A table addressed by database id and table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub database_id: String,
    pub table: String,
}

impl TableRef {
    fn of(address: &ResourceAddress) -> Option<Self> {
        Some(Self {
            database_id: address.database_id()?.to_string(),
            table: address.table_name()?.to_string(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database_id, self.table)
    }
}

/// All rules moving data from one source table into one target table.
#[derive(Debug, Clone)]
pub struct TablePairJob {
    pub source: TableRef,
    pub target: TableRef,
    /// Rules in attachment order.
    pub rules: Vec<Rule>,
}

impl TablePairJob {
    /// Display name used in logs and error lists: `src_db.table -> tgt_db.table`.
    pub fn name(&self) -> String {
        format!("{} -> {}", self.source, self.target)
    }

    /// Source columns read by the pair's rules, in first-use order.
    pub fn source_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for rule in &self.rules {
            for item in &rule.source_items {
                if let Some(column) = item.column_name() {
                    if !columns.iter().any(|c| c == column) {
                        columns.push(column.to_string());
                    }
                }
            }
        }
        columns
    }
}

/// Group rules into table-pair jobs.
///
/// Pairs come from rules with both sources and targets, keyed by the table of
/// their first source and first target item, in rule order. Generator rules
/// join every pair writing their target table; sink rules join every pair
/// reading their source table. Rules over non-table resources are skipped.
pub fn group_table_pairs(rules: &[Rule]) -> Result<Vec<TablePairJob>> {
    let mut jobs: Vec<TablePairJob> = Vec::new();
    let mut generators: Vec<(&Rule, TableRef)> = Vec::new();
    let mut sinks: Vec<(&Rule, TableRef)> = Vec::new();

    for rule in rules {
        let source = rule.source_items.first().map(TableRef::of);
        let target = rule.target_items.first().map(TableRef::of);

        match (source, target) {
            (Some(Some(source)), Some(Some(target))) => {
                match jobs
                    .iter()
                    .position(|j| j.source == source && j.target == target)
                {
                    Some(i) => jobs[i].rules.push(rule.clone()),
                    None => jobs.push(TablePairJob {
                        source,
                        target,
                        rules: vec![rule.clone()],
                    }),
                }
            }
            (None, Some(Some(target))) => generators.push((rule, target)),
            (Some(Some(source)), None) => sinks.push((rule, source)),
            _ => warn!(
                "Rule '{}' does not address table columns on both sides, skipping it for data copy",
                rule.name
            ),
        }
    }

    for (rule, target) in generators {
        let mut attached = false;
        for job in jobs.iter_mut().filter(|j| j.target == target) {
            job.rules.push(rule.clone());
            attached = true;
        }
        if !attached {
            warn!(
                "Generator rule '{}' writes {} which no other rule copies into, skipping it",
                rule.name, target
            );
        }
    }

    for (rule, source) in sinks {
        let mut attached = false;
        for job in jobs.iter_mut().filter(|j| j.source == source) {
            job.rules.push(rule.clone());
            attached = true;
        }
        if !attached {
            warn!(
                "Sink rule '{}' reads {} which no other rule copies from, skipping it",
                rule.name, source
            );
        }
    }

    if jobs.is_empty() {
        return Err(MappingError::precondition(
            "mapping has no rules connecting a source table to a target table",
        ));
    }

    Ok(jobs)
}
