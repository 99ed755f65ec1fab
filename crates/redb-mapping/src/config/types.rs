//! Configuration type definitions with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::core::MatchOptions;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mapping store (PostgreSQL) connection.
    pub store: StoreConfig,

    /// Schema-matching weights and thresholds.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Data copy tuning.
    #[serde(default)]
    pub copy: CopyConfig,

    /// Mesh broadcast of entity mutations.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Static transformation registry: name -> transformation type.
    #[serde(default)]
    pub transformations: BTreeMap<String, String>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.copy = self.copy.with_auto_tuning(&resources);
        if self.store.max_connections.is_none() {
            let workers = self.copy.get_parallel_workers();
            self.store.max_connections = Some((workers * 2).clamp(4, 32));
        }
        self
    }
}

/// Mapping store connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, verify-ca or verify-full (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Schema holding the store tables (default: "redb_mapping").
    #[serde(default = "default_store_schema")]
    pub schema: String,

    /// Pool size. Auto-tuned from the worker count if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl StoreConfig {
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(8)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("schema", &self.schema)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Weighted scoring configuration for the schema matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_name_weight")]
    pub name_weight: f64,

    #[serde(default = "default_type_weight")]
    pub type_weight: f64,

    #[serde(default = "default_classification_weight")]
    pub classification_weight: f64,

    #[serde(default = "default_privileged_data_weight")]
    pub privileged_data_weight: f64,

    #[serde(default = "default_structure_weight")]
    pub structure_weight: f64,

    /// Minimum score for a column match to become a rule (default: 0.3).
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,

    /// Scores under this are flagged as poor by the matcher (default: 0.4).
    #[serde(default = "default_poor_match_threshold")]
    pub poor_match_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            name_weight: default_name_weight(),
            type_weight: default_type_weight(),
            classification_weight: default_classification_weight(),
            privileged_data_weight: default_privileged_data_weight(),
            structure_weight: default_structure_weight(),
            acceptance_threshold: default_acceptance_threshold(),
            poor_match_threshold: default_poor_match_threshold(),
        }
    }
}

impl MatchingConfig {
    /// Options sent with every match request.
    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            name_weight: self.name_weight,
            type_weight: self.type_weight,
            classification_weight: self.classification_weight,
            privileged_data_weight: self.privileged_data_weight,
            structure_weight: self.structure_weight,
            acceptance_threshold: self.acceptance_threshold,
            poor_match_threshold: self.poor_match_threshold,
        }
    }
}

/// Data copy tuning.
/// `parallel_workers` uses Option<T> to distinguish between "not set"
/// (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Rows per source fetch batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent transform+insert tasks per table pair. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_workers: Option<usize>,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallel_workers: None,
        }
    }
}

impl CopyConfig {
    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Half the cores, at least 1 and at most 8: inserts are bound by the target
        if self.parallel_workers.is_none() {
            self.parallel_workers = Some((resources.cpu_cores / 2).clamp(1, 8));
        }

        info!(
            "Auto-tuned copy config: batch_size={}, parallel_workers={}",
            self.batch_size,
            self.get_parallel_workers()
        );

        self
    }

    pub fn get_parallel_workers(&self) -> usize {
        self.parallel_workers.unwrap_or(1)
    }
}

/// Mesh broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Broadcast mutations to peer nodes (default: false, single node).
    #[serde(default)]
    pub enabled: bool,

    /// Timeout for one detached broadcast task, in seconds (default: 5).
    #[serde(default = "default_broadcast_timeout")]
    pub timeout_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_broadcast_timeout(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_store_schema() -> String {
    "redb_mapping".to_string()
}

fn default_name_weight() -> f64 {
    0.4
}

fn default_type_weight() -> f64 {
    0.3
}

fn default_classification_weight() -> f64 {
    0.1
}

fn default_privileged_data_weight() -> f64 {
    0.1
}

fn default_structure_weight() -> f64 {
    0.1
}

fn default_acceptance_threshold() -> f64 {
    0.3
}

fn default_poor_match_threshold() -> f64 {
    0.4
}

fn default_batch_size() -> usize {
    1_000
}

fn default_broadcast_timeout() -> u64 {
    5
}
