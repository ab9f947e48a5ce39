//! Error types for search operations

use crate::error::AppError;

/// Result type for search operations
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Stable code for a query or write against an unregistered entity
pub const ENTITY_NOT_CONFIGURED: &str = "Search:EntityNotConfigured";

/// Stable code for a multi-index search with no requested entities
pub const EMPTY_ENTITIES: &str = "Search:EmptyEntities";

/// Errors that can occur during search operations
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// No descriptor is registered for the requested entity
    #[error("Entity not configured for search: {entity}")]
    EntityNotConfigured { entity: String },

    /// Multi-index search called without any entity names
    #[error("No entities requested for multi-index search")]
    EmptyEntities,

    /// Two descriptors claim the same index name
    #[error("Duplicate index name: {0}")]
    DuplicateIndexName(String),

    /// Index initialization failed
    #[error("Index initialization failed: {0}")]
    IndexInitFailed(String),

    /// Query parsing failed
    #[error("Query parsing failed: {0}")]
    QueryParsingFailed(String),

    /// Search execution failed
    #[error("Search execution failed: {0}")]
    SearchFailed(String),

    /// Document indexing failed
    #[error("Document indexing failed: {0}")]
    IndexingFailed(String),

    /// Document deletion failed
    #[error("Document deletion failed: {0}")]
    DeletionFailed(String),

    /// One or more batches of a unit-of-work flush were rejected
    #[error("Flush failed for {} batch(es): {}", failures.len(), failures.join("; "))]
    FlushFailed { failures: Vec<String> },

    /// Bulk synchronization stopped by its cancellation token
    #[error("Synchronization cancelled after {processed} entities")]
    Cancelled { processed: usize },

    /// Schema error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Entity source failure during synchronization
    #[error("Entity source failed: {0}")]
    SourceFailed(String),

    /// Tantivy error
    #[error("Tantivy error: {0}")]
    TantivyError(String),
}

impl SearchError {
    /// Build the not-configured error for an entity or index name
    pub fn not_configured(entity: impl Into<String>) -> Self {
        SearchError::EntityNotConfigured {
            entity: entity.into(),
        }
    }

    /// Stable business-rule code, when this is a configuration error
    pub fn code(&self) -> Option<&'static str> {
        match self {
            SearchError::EntityNotConfigured { .. } => Some(ENTITY_NOT_CONFIGURED),
            SearchError::EmptyEntities => Some(EMPTY_ENTITIES),
            _ => None,
        }
    }
}

impl From<tantivy::TantivyError> for SearchError {
    fn from(err: tantivy::TantivyError) -> Self {
        SearchError::TantivyError(err.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for SearchError {
    fn from(err: tantivy::query::QueryParserError) -> Self {
        SearchError::QueryParsingFailed(err.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for SearchError {
    fn from(err: tantivy::directory::error::OpenDirectoryError) -> Self {
        SearchError::IndexInitFailed(err.to_string())
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        if let Some(code) = err.code() {
            return AppError::BusinessRule {
                code: code.to_string(),
                message: err.to_string(),
            };
        }

        match err {
            SearchError::InvalidConfiguration(msg) | SearchError::DuplicateIndexName(msg) => {
                AppError::Configuration(msg)
            }
            SearchError::Cancelled { processed } => {
                AppError::Cancelled(format!("processed {} entities", processed))
            }
            SearchError::IoError(err) => AppError::Io(err),
            _ => AppError::Internal(err.to_string()),
        }
    }
}
