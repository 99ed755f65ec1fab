//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
store:
  host: localhost
  database: controlplane
  user: redb
  password: secret
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.store.port, 5432);
        assert_eq!(config.store.schema, "redb_mapping");
        assert_eq!(config.matching.acceptance_threshold, 0.3);
        assert_eq!(config.matching.poor_match_threshold, 0.4);
        assert_eq!(config.copy.batch_size, 1_000);
        assert!(config.copy.parallel_workers.is_none());
        assert!(!config.broadcast.enabled);
        assert_eq!(config.broadcast.timeout_secs, 5);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
store:
  host: db.internal
  port: 6543
  database: controlplane
  user: redb
  ssl_mode: verify-full
  max_connections: 12
matching:
  name_weight: 0.5
  acceptance_threshold: 0.6
copy:
  batch_size: 250
  parallel_workers: 3
broadcast:
  enabled: true
  timeout_secs: 10
transformations:
  uppercase: passthrough
  concat_names: merge
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.store.port, 6543);
        assert_eq!(config.store.get_max_connections(), 12);
        assert_eq!(config.matching.name_weight, 0.5);
        assert_eq!(config.copy.get_parallel_workers(), 3);
        assert!(config.broadcast.enabled);
        assert_eq!(config.transformations.get("concat_names").unwrap(), "merge");
    }

    #[test]
    fn test_missing_store_section() {
        assert!(Config::from_yaml("matching: {}").is_err());
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let yaml = format!("{}copy:\n  batch_size: 0\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.store.database, "controlplane");
    }

    #[test]
    fn test_auto_tuning_fills_unset_values() {
        let config = Config::from_yaml(MINIMAL).unwrap().with_auto_tuning();
        let workers = config.copy.get_parallel_workers();
        assert!((1..=8).contains(&workers));
        assert!(config.store.max_connections.is_some());
    }
}
