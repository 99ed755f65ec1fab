//! # redb-mapping
//!
//! Mapping and migration engine for a multi-database control plane.
//!
//! This library declares correspondences ("mappings") between databases,
//! tables, stream topics and MCP resources, and moves data across them:
//!
//! - **Resource addresses** (`redb://`, `mcp://`, `stream://`, legacy forms)
//! - **Cardinality rules** inferred and checked against transformation types
//! - **Schema matching** that turns similar columns into attached rules
//! - **Batched streaming copy** that keeps going when one table pair fails
//! - **Schema deployment** of single tables or whole commits across engines
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use redb_mapping::{Collaborators, Config, CopyRequest, MappingService, Scope};
//! # use redb_mapping::core::{ExecutionEngine, UnifiedModelService};
//!
//! # async fn run(
//! #     engine: Arc<dyn ExecutionEngine>,
//! #     matcher: Arc<dyn UnifiedModelService>,
//! # ) -> redb_mapping::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let service = MappingService::connect(
//!     &config,
//!     Collaborators { engine, matcher, registry: None, mesh: None },
//! )
//! .await?;
//!
//! let scope = Scope::new("tenant1", "ws1");
//! let mut progress = service
//!     .copy_mapping_data(&scope, "mapping-id", CopyRequest::default())
//!     .await?;
//! while let Some(update) = progress.recv().await {
//!     println!("{}: {} rows", update.status.as_str(), update.rows_processed);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod core;
pub mod deploy;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod store;

#[cfg(test)]
pub mod testing;

// Re-exports for convenient access
pub use crate::config::{BroadcastConfig, Config, CopyConfig, MatchingConfig, StoreConfig};
pub use crate::core::{
    Cardinality, Mapping, ResourceAddress, ResourceKind, Rule, Scope, TransformationType,
};
pub use crate::error::{MappingError, Result, StatusCode};
pub use crate::pipeline::{CopyProgress, CopyRequest, CopyStatus, MigrationPipeline, TransformMode};
pub use crate::service::{Collaborators, MappingService};
pub use crate::store::{MappingStore, MemoryStore, PgMappingStore};
