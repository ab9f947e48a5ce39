//! Keeps Tantivy full-text indexes in sync with transactional entity changes
//! and serves near-real-time single and multi-index search over them.

pub mod config;
pub mod error;
pub mod metrics;
pub mod search;
pub mod telemetry;

pub use config::{Config, ObservabilityConfig};
pub use error::{AppError, Result};
pub use search::{SearchConfig, SearchError, SearchModel, SearchQuery, SearchResult, SearchService};
