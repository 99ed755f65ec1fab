//! Error types for the mapping engine.

use std::fmt;

use thiserror::Error;

/// Machine-checkable status code carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Internal,
    Unimplemented,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::NotFound => "not_found",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::FailedPrecondition => "failed_precondition",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
            StatusCode::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for mapping operations.
#[derive(Error, Debug)]
pub enum MappingError {
    /// A workspace, database, mapping, rule or other entity is absent.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Malformed address, mismatched cardinality, unknown filter, etc.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The system is not in a state where the operation can run.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A collaborator service could not be reached.
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    /// Unexpected collaborator error or serialization failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The requested behavior is not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping store query error
    #[error("Store error: {0}")]
    Store(#[from] tokio_postgres::Error),

    /// Mapping store connection pool error
    #[error("Store pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,

    /// A multi-step operation failed after some steps took effect.
    #[error("{completed}, but {source}")]
    PartialSuccess {
        completed: String,
        #[source]
        source: Box<MappingError>,
    },
}

impl MappingError {
    /// Create a NotFound error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MappingError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create an Unavailable error for a collaborator service.
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        MappingError::Unavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        MappingError::InvalidArgument(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        MappingError::FailedPrecondition(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MappingError::Internal(message.into())
    }

    /// Wrap a failure that happened after `completed` already took effect.
    pub fn partial(completed: impl Into<String>, source: MappingError) -> Self {
        MappingError::PartialSuccess {
            completed: completed.into(),
            source: Box::new(source),
        }
    }

    /// Status code for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            MappingError::NotFound { .. } => StatusCode::NotFound,
            MappingError::InvalidArgument(_) | MappingError::Config(_) => {
                StatusCode::InvalidArgument
            }
            MappingError::FailedPrecondition(_) | MappingError::Cancelled => {
                StatusCode::FailedPrecondition
            }
            MappingError::Unavailable { .. } | MappingError::Pool(_) => StatusCode::Unavailable,
            MappingError::Unimplemented(_) => StatusCode::Unimplemented,
            MappingError::Internal(_)
            | MappingError::Store(_)
            | MappingError::Io(_)
            | MappingError::Yaml(_)
            | MappingError::Json(_) => StatusCode::Internal,
            MappingError::PartialSuccess { source, .. } => source.code(),
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MappingError::Config(_) | MappingError::Yaml(_) => 1,
            MappingError::InvalidArgument(_) => 2,
            MappingError::NotFound { .. } => 3,
            MappingError::FailedPrecondition(_) => 4,
            MappingError::Unavailable { .. } | MappingError::Pool(_) => 5,
            MappingError::Store(_) => 6,
            MappingError::Io(_) => 7,
            MappingError::Unimplemented(_) => 8,
            MappingError::Cancelled => 130,
            MappingError::Internal(_) | MappingError::Json(_) => 10,
            MappingError::PartialSuccess { source, .. } => source.exit_code(),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error [{}]: {}\n", self.code(), self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for mapping operations.
pub type Result<T> = std::result::Result<T, MappingError>;
