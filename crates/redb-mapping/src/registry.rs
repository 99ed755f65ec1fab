//! Transformation registry backed by the `transformations` config section.
//!
//! Used when no remote transformation service is wired in. It can describe
//! transformations so that rule cardinalities are still checked, but it cannot
//! execute them: copying a mapping that uses one fails that table pair with
//! `Unimplemented`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{TransformationInfo, TransformationRegistry, TransformationType};
use crate::error::{MappingError, Result};

/// Static `name -> type` registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: BTreeMap<String, TransformationType>,
}

impl StaticRegistry {
    pub fn new(entries: &BTreeMap<String, String>) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(name, ty)| (name.clone(), TransformationType::from(ty.as_str())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TransformationRegistry for StaticRegistry {
    async fn describe(&self, name: &str) -> Result<Option<TransformationInfo>> {
        Ok(self.entries.get(name).map(|kind| TransformationInfo {
            name: name.to_string(),
            kind: kind.clone(),
            valid: true,
        }))
    }

    async fn apply(
        &self,
        name: &str,
        _options: &BTreeMap<String, String>,
        _inputs: Vec<Vec<Value>>,
    ) -> Result<Vec<Vec<Value>>> {
        if !self.entries.contains_key(name) {
            return Err(MappingError::not_found("transformation", name));
        }
        Err(MappingError::Unimplemented(format!(
            "transformation '{}' needs a transformation service to run",
            name
        )))
    }
}
