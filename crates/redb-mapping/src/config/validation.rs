//! Configuration validation.

use super::Config;
use crate::core::TransformationType;
use crate::error::{MappingError, Result};

const SSL_MODES: [&str; 3] = ["disable", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    if config.store.host.is_empty() {
        return Err(MappingError::Config("store.host is required".into()));
    }
    if config.store.database.is_empty() {
        return Err(MappingError::Config("store.database is required".into()));
    }
    if config.store.user.is_empty() {
        return Err(MappingError::Config("store.user is required".into()));
    }
    if config.store.schema.is_empty() {
        return Err(MappingError::Config("store.schema cannot be empty".into()));
    }
    if !config
        .store
        .schema
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(MappingError::Config(format!(
            "store.schema '{}' may only contain letters, digits and underscores",
            config.store.schema
        )));
    }
    if !SSL_MODES.contains(&config.store.ssl_mode.as_str()) {
        return Err(MappingError::Config(format!(
            "store.ssl_mode '{}' is invalid. Valid options: {}",
            config.store.ssl_mode,
            SSL_MODES.join(", ")
        )));
    }
    if let Some(0) = config.store.max_connections {
        return Err(MappingError::Config(
            "store.max_connections must be at least 1".into(),
        ));
    }

    // Matching validation
    let m = &config.matching;
    let weights = [
        ("name_weight", m.name_weight),
        ("type_weight", m.type_weight),
        ("classification_weight", m.classification_weight),
        ("privileged_data_weight", m.privileged_data_weight),
        ("structure_weight", m.structure_weight),
    ];
    if let Some((name, w)) = weights.iter().find(|(_, w)| !w.is_finite() || *w < 0.0) {
        return Err(MappingError::Config(format!(
            "matching.{} must be a non-negative number, got {}",
            name, w
        )));
    }
    if weights.iter().map(|(_, w)| w).sum::<f64>() <= 0.0 {
        return Err(MappingError::Config(
            "matching weights must sum to a positive value".into(),
        ));
    }
    for (name, t) in [
        ("acceptance_threshold", m.acceptance_threshold),
        ("poor_match_threshold", m.poor_match_threshold),
    ] {
        if !(0.0..=1.0).contains(&t) {
            return Err(MappingError::Config(format!(
                "matching.{} must be between 0 and 1, got {}",
                name, t
            )));
        }
    }

    // Copy validation - only check if explicitly set
    if config.copy.batch_size == 0 {
        return Err(MappingError::Config(
            "copy.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.copy.parallel_workers {
        return Err(MappingError::Config(
            "copy.parallel_workers must be at least 1".into(),
        ));
    }

    // Broadcast validation
    if !(1..=60).contains(&config.broadcast.timeout_secs) {
        return Err(MappingError::Config(format!(
            "broadcast.timeout_secs must be between 1 and 60, got {}",
            config.broadcast.timeout_secs
        )));
    }

    // Transformation registry validation
    for (name, ty) in &config.transformations {
        if name.trim().is_empty() {
            return Err(MappingError::Config(
                "transformation names cannot be empty".into(),
            ));
        }
        if let TransformationType::Other(other) = TransformationType::from(ty.as_str()) {
            if other.trim().is_empty() {
                return Err(MappingError::Config(format!(
                    "transformations.{} has an empty type",
                    name
                )));
            }
        }
    }

    Ok(())
}
