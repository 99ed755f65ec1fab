//! Applies a pair's rules to a batch of source rows.

use serde_json::Value;

use crate::core::{Row, Rule, TransformationRegistry};
use crate::error::{MappingError, Result};

/// Turns source rows into target rows for one table pair.
///
/// `direct_mapping` rules copy values: target item `i` takes source item
/// `min(i, sources - 1)`, so one-to-many replicates and many-to-one keeps the
/// first source. Any other transformation is applied by the registry, once
/// per rule per batch.
pub struct RowTransformer<'a> {
    registry: &'a dyn TransformationRegistry,
    rules: &'a [Rule],
}

impl<'a> RowTransformer<'a> {
    pub fn new(registry: &'a dyn TransformationRegistry, rules: &'a [Rule]) -> Self {
        Self { registry, rules }
    }

    /// Whether every rule is a plain column copy.
    pub fn is_passthrough(&self) -> bool {
        self.rules.iter().all(|r| r.is_direct())
    }

    pub async fn transform(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        let mut output: Vec<Row> = vec![Row::new(); rows.len()];

        for rule in self.rules {
            let targets: Vec<&str> = rule
                .target_items
                .iter()
                .filter_map(|t| t.column_name())
                .collect();
            if targets.is_empty() {
                continue;
            }

            let inputs: Vec<Vec<Value>> = rows.iter().map(|row| source_values(rule, row)).collect();

            let values = if rule.is_direct() {
                inputs
                    .into_iter()
                    .map(|sources| direct_values(&sources, targets.len()))
                    .collect()
            } else {
                let values = self
                    .registry
                    .apply(&rule.transformation, &rule.options, inputs)
                    .await?;
                check_shape(rule, &values, rows.len(), targets.len())?;
                values
            };

            for (out, row_values) in output.iter_mut().zip(values) {
                for (column, value) in targets.iter().zip(row_values) {
                    out.insert((*column).to_string(), value);
                }
            }
        }

        Ok(output)
    }
}

fn source_values(rule: &Rule, row: &Row) -> Vec<Value> {
    rule.source_items
        .iter()
        .filter_map(|s| s.column_name())
        .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}

fn direct_values(sources: &[Value], target_count: usize) -> Vec<Value> {
    (0..target_count)
        .map(|i| match sources.len() {
            0 => Value::Null,
            n => sources[i.min(n - 1)].clone(),
        })
        .collect()
}

fn check_shape(rule: &Rule, values: &[Vec<Value>], rows: usize, targets: usize) -> Result<()> {
    if values.len() != rows {
        return Err(MappingError::internal(format!(
            "transformation '{}' of rule '{}' returned {} rows for {} input rows",
            rule.transformation,
            rule.name,
            values.len(),
            rows
        )));
    }
    if let Some(bad) = values.iter().find(|v| v.len() != targets) {
        return Err(MappingError::internal(format!(
            "transformation '{}' of rule '{}' returned {} values per row, expected {}",
            rule.transformation,
            rule.name,
            bad.len(),
            targets
        )));
    }
    Ok(())
}
