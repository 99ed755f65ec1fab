//! Core abstractions for the mapping engine.
//!
//! This module provides the foundational types and traits used throughout
//! the engine:
//!
//! - [`address`]: Typed resource addresses and their string forms
//! - [`cardinality`]: Rule cardinality inference and transformation compatibility
//! - [`filter`]: Mapping filter types and validation
//! - [`model`]: Mappings, rules, containers and items as persisted
//! - [`schema`]: Database-agnostic schema model
//! - [`traits`]: Contracts of the external collaborators
//!
//! # Architecture
//!
//! Everything here is either pure (address parsing, cardinality rules, filter
//! validation) or a trait boundary. Real database I/O, schema matching and
//! transformation execution live behind [`traits`] so the orchestration code
//! can be tested against in-memory implementations.

pub mod address;
pub mod cardinality;
pub mod filter;
pub mod model;
pub mod schema;
pub mod traits;

// Re-export commonly used types for convenience
pub use address::{
    resolve, AddressScope, DatabaseDirectory, ObjectType, ParsedAddress, Protocol,
    ResolvedAddress, ResourceAddress, StreamAddress,
};
pub use cardinality::{
    infer_cardinality, validate_cardinality, validate_transformation_cardinality, Cardinality,
    TransformationType,
};
pub use filter::{
    validate_filter, validate_filter_operator, FilterOperator, FilterType, MappingFilter,
};
pub use model::{
    AttachedRule, CommitSchema, ContainerKind, DatabaseRecord, Mapping, PrivilegedData,
    Provenance, ResourceContainer, ResourceItem, ResourceKind, Rule, RuleMetadata, Scope,
    ValidationState, DIRECT_MAPPING,
};
pub use schema::{ColumnSchema, SchemaModel, TableSchema, UserType};
pub use traits::{
    BroadcastMessage, BroadcastOperation, ColumnEnrichment, ColumnMatch, DiscoveredSchema,
    EnrichedSchema, ExecutionEngine, FetchOptions, MatchOptions, MatchRequest, MatchResult,
    MeshTransport, NewDatabase, Row, RowBatch, RowStream, TableEnrichment, TableMatch,
    TransformationInfo, TransformationRegistry, UnifiedModelService,
};
