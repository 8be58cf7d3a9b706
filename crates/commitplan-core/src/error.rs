//! Error types for commit compilation and identity reconciliation.

use std::fmt;

/// The primary error type for all commit operations.
///
/// Every variant is fatal for the commit that produced it: the caller discards
/// the compiled row operations and rolls back its transaction.
#[derive(Debug)]
pub enum Error {
    /// The change graph asks for something the mapping does not allow
    Mapping(MappingError),
    /// An identity could not be resolved or reconciled
    Identity(IdentityError),
    /// Row operations could not be put into a dependency-respecting order
    Ordering(OrderingError),
    /// The external batch executor reported a failure
    Execution(ExecutionError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
    /// Entity or table the violation was detected on.
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Write routed to an entity mapped as read-only
    ReadOnlyEntity,
    /// Entity name not present in the mapping
    UnknownEntity,
    /// Table name not present in the mapping
    UnknownTable,
    /// Column or property not present on its entity/table
    UnknownProperty,
    /// Relationship (arc) not present on its entity/table
    UnknownRelationship,
    /// Relationship shape the propagation rules do not support
    UnsupportedRelationship,
    /// Malformed db path
    InvalidPath,
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Deferred value chain exceeded the configured bound
    SupplierChainTooLong,
    /// A primary key value was never generated or propagated
    PrimaryKeyNotGenerated,
    /// A flattened intermediate row has no key after insert
    FlattenedIdNotSet,
    /// Generated key rows do not match the submitted identities
    GeneratedKeyCountMismatch,
    /// A generated key row carried no columns
    EmptyGeneratedKey,
    /// Handle does not belong to this commit
    UnknownId,
    /// Optimistic locking needs the prior state of an object that has none
    MissingSnapshot,
}

#[derive(Debug)]
pub struct OrderingError {
    pub message: String,
    /// Tables taking part in the cycle, in traversal order.
    pub tables: Vec<String>,
}

#[derive(Debug)]
pub struct ExecutionError {
    pub message: String,
    /// Table of the batch that failed.
    pub table: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl MappingError {
    /// Create a mapping error for an entity or table.
    pub fn new(kind: MappingErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity: Some(entity.into()),
        }
    }

    /// Write attempted against a read-only entity.
    pub fn read_only(entity: &str) -> Self {
        Self::new(
            MappingErrorKind::ReadOnlyEntity,
            entity,
            format!(
                "Attempt to modify object(s) mapped to a read-only entity: '{entity}'. Can't commit changes."
            ),
        )
    }
}

impl IdentityError {
    pub fn new(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            table: None,
            source: None,
        }
    }

    /// Attach the table of the failing batch.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach the underlying driver error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl Error {
    /// Shorthand for a mapping error.
    pub fn mapping(kind: MappingErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError::new(kind, entity, message))
    }

    /// Shorthand for an identity error.
    pub fn identity(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Error::Identity(IdentityError::new(kind, message))
    }

    /// Is this a mapping violation (read-only write, unsupported shape, unknown name)?
    pub fn is_mapping_error(&self) -> bool {
        matches!(self, Error::Mapping(_))
    }

    /// Is this an identity error (unresolved key, bad generated keys)?
    pub fn is_identity_error(&self) -> bool {
        matches!(self, Error::Identity(_))
    }

    /// Mapping error kind, if this is a mapping error.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Identity error kind, if this is an identity error.
    pub fn identity_kind(&self) -> Option<IdentityErrorKind> {
        match self {
            Error::Identity(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Identity(e) => write!(f, "Identity error: {}", e),
            Error::Ordering(e) => write!(f, "Ordering error: {}", e),
            Error::Execution(e) => write!(f, "Execution error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Execution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for OrderingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tables.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.message, self.tables.join(" -> "))
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{} (table '{}')", self.message, table)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

impl From<OrderingError> for Error {
    fn from(err: OrderingError) -> Self {
        Error::Ordering(err)
    }
}

impl From<ExecutionError> for Error {
    fn from(err: ExecutionError) -> Self {
        Error::Execution(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for commit operations.
pub type Result<T> = std::result::Result<T, Error>;
