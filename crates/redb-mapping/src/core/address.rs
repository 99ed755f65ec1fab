//! Typed resource addresses.
//!
//! Every database, table, column, stream topic and external tool resource the
//! engine can map is named by a scheme-prefixed string:
//!
//! - `redb://data/database/{id}[/table/{name}[/column/{name}]]` (canonical)
//! - `mcp://{resource_name}`
//! - `stream://{workspace}/{kind}/{integration}/{topic}`
//! - legacy `db://{id}.{table}.{column}` and bare `database[.table]`
//!
//! Parsing is strict: malformed input is rejected with an error naming the
//! expected pattern. Building is pure formatting, and the canonical form
//! round-trips exactly.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::error::{MappingError, Result};

const REDB_PREFIX: &str = "redb://data/database/";
const MCP_PREFIX: &str = "mcp://";
const STREAM_PREFIX: &str = "stream://";
const LEGACY_DB_PREFIX: &str = "db://";

const REDB_PATTERN: &str = "redb://data/database/{id}[/table/{name}[/column/{name}]]";
const STREAM_PATTERN: &str = "stream://{workspace}/{kind}/{integration}/{topic}";
const LEGACY_DB_PATTERN: &str = "db://{id}.{table}.{column}";

/// Address protocol (scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Redb,
    Mcp,
    Stream,
    /// `db://{id}.{table}.{col}`
    LegacyDb,
    /// `database[.table]`
    LegacyDotted,
}

/// Kind of object an address points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Database,
    Table,
    Column,
    McpResource,
    StreamTopic,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Database => "database",
            ObjectType::Table => "table",
            ObjectType::Column => "column",
            ObjectType::McpResource => "mcp_resource",
            ObjectType::StreamTopic => "stream_topic",
        }
    }
}

/// A stream topic address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    pub workspace: String,
    pub kind: String,
    pub integration: String,
    pub topic: String,
}

/// A parsed, typed resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    Database {
        database_id: String,
    },
    Table {
        database_id: String,
        table: String,
    },
    Column {
        database_id: String,
        table: String,
        column: String,
    },
    Mcp {
        resource: String,
    },
    Stream(StreamAddress),
}

/// An address together with the protocol it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub protocol: Protocol,
    pub address: ResourceAddress,
}

/// Scope requested when building an address from loose parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Database,
    Table,
    Column,
}

impl FromStr for AddressScope {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "database" => Ok(AddressScope::Database),
            "table" => Ok(AddressScope::Table),
            "column" => Ok(AddressScope::Column),
            other => Err(MappingError::invalid(format!(
                "unsupported address scope '{}': expected database, table or column",
                other
            ))),
        }
    }
}

impl ResourceAddress {
    pub fn database(database_id: impl Into<String>) -> Self {
        ResourceAddress::Database {
            database_id: database_id.into(),
        }
    }

    pub fn table(database_id: impl Into<String>, table: impl Into<String>) -> Self {
        ResourceAddress::Table {
            database_id: database_id.into(),
            table: table.into(),
        }
    }

    pub fn column(
        database_id: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        ResourceAddress::Column {
            database_id: database_id.into(),
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn mcp(resource: impl Into<String>) -> Self {
        ResourceAddress::Mcp {
            resource: resource.into(),
        }
    }

    /// Build a stream topic address keyed by workspace, integration and topic.
    pub fn stream(
        workspace: impl Into<String>,
        kind: impl Into<String>,
        integration: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        ResourceAddress::Stream(StreamAddress {
            workspace: workspace.into(),
            kind: kind.into(),
            integration: integration.into(),
            topic: topic.into(),
        })
    }

    /// Build a database-scoped address from loose parts.
    ///
    /// A table or column scope with missing parts degrades to the nearest
    /// complete parent (ultimately the database address) and logs a warning.
    pub fn for_scope(
        scope: AddressScope,
        database_id: &str,
        table: Option<&str>,
        column: Option<&str>,
    ) -> Result<Self> {
        if database_id.is_empty() {
            return Err(MappingError::invalid(
                "database id is required to build a resource address",
            ));
        }
        let table = table.filter(|t| !t.is_empty());
        let column = column.filter(|c| !c.is_empty());

        let address = match (scope, table, column) {
            (AddressScope::Database, _, _) => Self::database(database_id),
            (AddressScope::Table, Some(t), _) => Self::table(database_id, t),
            (AddressScope::Column, Some(t), Some(c)) => Self::column(database_id, t, c),
            (AddressScope::Column, Some(t), None) => {
                warn!(
                    "Column address for {}.{} has no column name, degrading to table address",
                    database_id, t
                );
                Self::table(database_id, t)
            }
            (_, None, _) => {
                warn!(
                    "{:?} address for database {} has no table name, degrading to database address",
                    scope, database_id
                );
                Self::database(database_id)
            }
        };
        Ok(address)
    }

    /// Parse any supported address form.
    pub fn parse(input: &str) -> Result<Self> {
        Ok(Self::parse_with_protocol(input)?.address)
    }

    /// Parse any supported address form, keeping the protocol it used.
    pub fn parse_with_protocol(input: &str) -> Result<ParsedAddress> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MappingError::invalid("resource address cannot be empty"));
        }

        if let Some(rest) = input.strip_prefix("redb://") {
            return parse_redb(rest, input).map(|address| ParsedAddress {
                protocol: Protocol::Redb,
                address,
            });
        }
        if let Some(rest) = input.strip_prefix(MCP_PREFIX) {
            if rest.is_empty() || rest.contains('/') {
                return Err(MappingError::invalid(format!(
                    "invalid MCP address '{}': expected mcp://{{resource_name}}",
                    input
                )));
            }
            return Ok(ParsedAddress {
                protocol: Protocol::Mcp,
                address: Self::mcp(rest),
            });
        }
        if let Some(rest) = input.strip_prefix(STREAM_PREFIX) {
            return parse_stream(rest, input).map(|address| ParsedAddress {
                protocol: Protocol::Stream,
                address,
            });
        }
        if let Some(rest) = input.strip_prefix(LEGACY_DB_PREFIX) {
            return parse_legacy_db(rest, input).map(|address| ParsedAddress {
                protocol: Protocol::LegacyDb,
                address,
            });
        }
        if input.contains("://") {
            return Err(MappingError::invalid(format!(
                "unsupported address scheme in '{}': expected redb://, mcp://, stream:// or db://",
                input
            )));
        }

        parse_legacy_dotted(input).map(|address| ParsedAddress {
            protocol: Protocol::LegacyDotted,
            address,
        })
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            ResourceAddress::Database { .. } => ObjectType::Database,
            ResourceAddress::Table { .. } => ObjectType::Table,
            ResourceAddress::Column { .. } => ObjectType::Column,
            ResourceAddress::Mcp { .. } => ObjectType::McpResource,
            ResourceAddress::Stream(_) => ObjectType::StreamTopic,
        }
    }

    /// Database id for database-scoped addresses.
    pub fn database_id(&self) -> Option<&str> {
        match self {
            ResourceAddress::Database { database_id }
            | ResourceAddress::Table { database_id, .. }
            | ResourceAddress::Column { database_id, .. } => Some(database_id),
            _ => None,
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        match self {
            ResourceAddress::Table { table, .. } | ResourceAddress::Column { table, .. } => {
                Some(table)
            }
            _ => None,
        }
    }

    pub fn column_name(&self) -> Option<&str> {
        match self {
            ResourceAddress::Column { column, .. } => Some(column),
            _ => None,
        }
    }

    /// Name of the addressed object (the innermost path segment).
    pub fn object_name(&self) -> &str {
        match self {
            ResourceAddress::Database { database_id } => database_id,
            ResourceAddress::Table { table, .. } => table,
            ResourceAddress::Column { column, .. } => column,
            ResourceAddress::Mcp { resource } => resource,
            ResourceAddress::Stream(s) => &s.topic,
        }
    }

    /// The owning table address of a column, or the address itself otherwise.
    pub fn container(&self) -> ResourceAddress {
        match self {
            ResourceAddress::Column {
                database_id, table, ..
            } => Self::table(database_id.clone(), table.clone()),
            other => other.clone(),
        }
    }

    /// Whether `self` lies inside `other` (or is equal to it).
    pub fn is_within(&self, other: &ResourceAddress) -> bool {
        match (self.database_id(), other) {
            (Some(db), ResourceAddress::Database { database_id }) => db == database_id.as_str(),
            (
                Some(db),
                ResourceAddress::Table {
                    database_id,
                    table,
                },
            ) => db == database_id.as_str() && self.table_name() == Some(table.as_str()),
            _ => self == other,
        }
    }
}

fn segment_ok(s: &str) -> bool {
    !s.is_empty() && !s.contains('/')
}

fn parse_redb(rest: &str, input: &str) -> Result<ResourceAddress> {
    let malformed = || {
        MappingError::invalid(format!(
            "invalid redb address '{}': expected {}",
            input, REDB_PATTERN
        ))
    };

    let path = rest.strip_prefix("data/database/").ok_or_else(malformed)?;
    let parts: Vec<&str> = path.split('/').collect();

    match parts.as_slice() {
        [id] if segment_ok(id) => Ok(ResourceAddress::database(*id)),
        [id, "table", table] if segment_ok(id) && segment_ok(table) => {
            Ok(ResourceAddress::table(*id, *table))
        }
        [id, "table", table, "column", column]
            if segment_ok(id) && segment_ok(table) && segment_ok(column) =>
        {
            Ok(ResourceAddress::column(*id, *table, *column))
        }
        _ => Err(malformed()),
    }
}

fn parse_stream(rest: &str, input: &str) -> Result<ResourceAddress> {
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [workspace, kind, integration, topic] if parts.iter().all(|p| segment_ok(p)) => Ok(
            ResourceAddress::stream(*workspace, *kind, *integration, *topic),
        ),
        _ => Err(MappingError::invalid(format!(
            "invalid stream address '{}': expected {}",
            input, STREAM_PATTERN
        ))),
    }
}

fn parse_legacy_db(rest: &str, input: &str) -> Result<ResourceAddress> {
    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [id, table, column] if parts.iter().all(|p| segment_ok(p)) => {
            Ok(ResourceAddress::column(*id, *table, *column))
        }
        _ => Err(MappingError::invalid(format!(
            "invalid legacy address '{}': expected {}",
            input, LEGACY_DB_PATTERN
        ))),
    }
}

fn parse_legacy_dotted(input: &str) -> Result<ResourceAddress> {
    let parts: Vec<&str> = input.split('.').collect();
    match parts.as_slice() {
        [db] if segment_ok(db) => Ok(ResourceAddress::database(*db)),
        [db, table] if segment_ok(db) && segment_ok(table) => {
            Ok(ResourceAddress::table(*db, *table))
        }
        _ => Err(MappingError::invalid(format!(
            "invalid address '{}': expected {} or database[.table]",
            input, REDB_PATTERN
        ))),
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Database { database_id } => {
                write!(f, "{}{}", REDB_PREFIX, database_id)
            }
            ResourceAddress::Table { database_id, table } => {
                write!(f, "{}{}/table/{}", REDB_PREFIX, database_id, table)
            }
            ResourceAddress::Column {
                database_id,
                table,
                column,
            } => write!(
                f,
                "{}{}/table/{}/column/{}",
                REDB_PREFIX, database_id, table, column
            ),
            ResourceAddress::Mcp { resource } => write!(f, "{}{}", MCP_PREFIX, resource),
            ResourceAddress::Stream(s) => write!(
                f,
                "{}{}/{}/{}/{}",
                STREAM_PREFIX, s.workspace, s.kind, s.integration, s.topic
            ),
        }
    }
}

impl FromStr for ResourceAddress {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ResourceAddress::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Lookup of human-readable database names by id.
#[async_trait]
pub trait DatabaseDirectory: Send + Sync {
    async fn database_name(&self, database_id: &str) -> Result<Option<String>>;
}

/// A database-scoped address with its database name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub protocol: Protocol,
    pub address: ResourceAddress,
    pub database_name: Option<String>,
}

/// Parse an address and resolve the embedded database id to its name.
///
/// Database-scoped addresses whose id is unknown to the directory fail with
/// `NotFound`; MCP and stream addresses pass through unresolved.
pub async fn resolve(input: &str, directory: &dyn DatabaseDirectory) -> Result<ResolvedAddress> {
    let parsed = ResourceAddress::parse_with_protocol(input)?;
    let database_name = match parsed.address.database_id() {
        Some(id) => Some(
            directory
                .database_name(id)
                .await?
                .ok_or_else(|| MappingError::not_found("database", id))?,
        ),
        None => None,
    };

    Ok(ResolvedAddress {
        protocol: parsed.protocol,
        address: parsed.address,
        database_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticDirectory(HashMap<String, String>);

    #[async_trait]
    impl DatabaseDirectory for StaticDirectory {
        async fn database_name(&self, database_id: &str) -> Result<Option<String>> {
            Ok(self.0.get(database_id).cloned())
        }
    }

    #[test]
    fn test_parse_column_address() {
        let addr = ResourceAddress::parse("redb://data/database/db1/table/users/column/email")
            .unwrap();
        assert_eq!(addr, ResourceAddress::column("db1", "users", "email"));
        assert_eq!(addr.database_id(), Some("db1"));
        assert_eq!(addr.table_name(), Some("users"));
        assert_eq!(addr.column_name(), Some("email"));
    }

    #[test]
    fn test_column_address_round_trip() {
        let input = "redb://data/database/db1/table/users/column/email";
        let built = ResourceAddress::column("db1", "users", "email").to_string();
        assert_eq!(built, input);
        assert_eq!(ResourceAddress::parse(&built).unwrap().to_string(), input);
    }

    #[test]
    fn test_parse_database_and_table() {
        assert_eq!(
            ResourceAddress::parse("redb://data/database/db1").unwrap(),
            ResourceAddress::database("db1")
        );
        let table = ResourceAddress::parse("redb://data/database/db1/table/orders").unwrap();
        assert_eq!(table.object_type(), ObjectType::Table);
        assert_eq!(table.object_name(), "orders");
    }

    #[test]
    fn test_parse_rejects_malformed_redb() {
        for bad in [
            "redb://data/database/",
            "redb://data/database/db1/table",
            "redb://data/database/db1/view/users",
            "redb://data/database/db1/table/users/column",
            "redb://other/db1",
        ] {
            let err = ResourceAddress::parse(bad).unwrap_err();
            assert!(
                err.to_string().contains("redb://data/database/{id}"),
                "error for {} should name the pattern: {}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_parse_mcp() {
        let parsed = ResourceAddress::parse_with_protocol("mcp://customer_lookup").unwrap();
        assert_eq!(parsed.protocol, Protocol::Mcp);
        assert_eq!(parsed.address, ResourceAddress::mcp("customer_lookup"));
        assert!(ResourceAddress::parse("mcp://").is_err());
    }

    #[test]
    fn test_parse_stream() {
        let addr = ResourceAddress::parse("stream://ws1/kafka/int1/orders").unwrap();
        assert_eq!(addr, ResourceAddress::stream("ws1", "kafka", "int1", "orders"));
        assert_eq!(addr.to_string(), "stream://ws1/kafka/int1/orders");
        assert!(ResourceAddress::parse("stream://ws1/kafka/orders").is_err());
    }

    #[test]
    fn test_parse_legacy_forms() {
        let parsed = ResourceAddress::parse_with_protocol("db://db1.users.email").unwrap();
        assert_eq!(parsed.protocol, Protocol::LegacyDb);
        assert_eq!(parsed.address, ResourceAddress::column("db1", "users", "email"));

        let dotted = ResourceAddress::parse_with_protocol("db1.users").unwrap();
        assert_eq!(dotted.protocol, Protocol::LegacyDotted);
        assert_eq!(dotted.address, ResourceAddress::table("db1", "users"));

        assert!(ResourceAddress::parse("db://db1.users").is_err());
        assert!(ResourceAddress::parse("a.b.c").is_err());
    }

    #[test]
    fn test_unknown_scheme_fails_closed() {
        assert!(ResourceAddress::parse("ftp://example/file").is_err());
        assert!("table".parse::<AddressScope>().is_ok());
        assert!("schema".parse::<AddressScope>().is_err());
    }

    #[test]
    fn test_for_scope_degrades_missing_parts() {
        let addr = ResourceAddress::for_scope(AddressScope::Column, "db1", None, Some("email"))
            .unwrap();
        assert_eq!(addr, ResourceAddress::database("db1"));

        let addr =
            ResourceAddress::for_scope(AddressScope::Column, "db1", Some("users"), None).unwrap();
        assert_eq!(addr, ResourceAddress::table("db1", "users"));

        assert!(ResourceAddress::for_scope(AddressScope::Table, "", Some("users"), None).is_err());
    }

    #[test]
    fn test_is_within() {
        let col = ResourceAddress::column("db1", "users", "email");
        assert!(col.is_within(&ResourceAddress::database("db1")));
        assert!(col.is_within(&ResourceAddress::table("db1", "users")));
        assert!(!col.is_within(&ResourceAddress::table("db1", "orders")));
        assert!(!col.is_within(&ResourceAddress::database("db2")));
    }

    #[test]
    fn test_serde_as_string() {
        let addr = ResourceAddress::column("db1", "users", "id");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"redb://data/database/db1/table/users/column/id\"");
        let back: ResourceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[tokio::test]
    async fn test_resolve_database_name() {
        let directory = StaticDirectory(HashMap::from([(
            "db1".to_string(),
            "Customers".to_string(),
        )]));

        let resolved = resolve("redb://data/database/db1/table/users", &directory)
            .await
            .unwrap();
        assert_eq!(resolved.database_name.as_deref(), Some("Customers"));

        let err = resolve("redb://data/database/missing", &directory)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::StatusCode::NotFound);

        let mcp = resolve("mcp://tool", &directory).await.unwrap();
        assert!(mcp.database_name.is_none());
    }
}
