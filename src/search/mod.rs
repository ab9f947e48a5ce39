//! Transactional full-text indexing and search powered by Tantivy
//!
//! Entity changes observed inside a unit of work are buffered and written to
//! the entity's index only after the unit of work commits. Reads go through
//! leased searchers that always see the latest committed snapshot.
//!
//! # Architecture
//!
//! ```text
//! entity change ──▶ IndexingHandler ──▶ ChangeCollector (per unit of work)
//!                                              │ on commit
//!                                              ▼
//!                                      IndexWriterGateway ──▶ Tantivy index
//!                                       (one gate per path)        │
//!                                                                  ▼
//! SearchService ──▶ QueryComposer + filters ──▶ SearcherLeaseManager
//! ```
//!
//! # Example
//!
//! ```no_run
//! use entity_index_sync::search::{SearchConfig, SearchModel, SearchQuery, SearchService};
//!
//! struct Book {
//!     id: String,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut model = SearchModel::new();
//!     model.entity::<Book, _>(|e| {
//!         e.id("Id", |b: &Book| b.id.clone())
//!             .field("Title", |b: &Book| b.title.clone(), |f| f.store())
//!     })?;
//!
//!     let search = SearchService::new(SearchConfig::default(), model);
//!     search
//!         .gateway()
//!         .index(&Book { id: "1".into(), title: "Lucene in Action".into() })
//!         .await?;
//!
//!     let results = search.search("Book", &SearchQuery::new("lucene")).await?;
//!     println!("Found {} books", results.total_hits);
//!     Ok(())
//! }
//! ```

mod collector;
mod config;
mod descriptor;
mod document;
mod error;
mod events;
mod filter;
mod highlight;
mod index;
mod query;
mod searcher;
mod service;
mod sync;
mod uow;

pub use collector::{ChangeCollector, FlushSummary, PendingChanges};
pub use config::{HighlightConfig, MultiFieldMode, SearchConfig, SearchConfigBuilder, MAX_FUZZY_EDITS};
pub use descriptor::{
    entity_ref, short_type_name, EntityRef, EntitySearchBuilder, EntitySearchDescriptor, FieldBuilder,
    FieldDescriptor, ForcedFilter, IntoFieldValue, SearchModel, SearchScope, DEFAULT_ID_FIELD,
    DEFAULT_VALUE_FIELD,
};
pub use document::{build_schema, DocumentProjector, ProjectedDocument, INDEX_NAME_FIELD};
pub use error::{SearchError, SearchResult, EMPTY_ENTITIES, ENTITY_NOT_CONFIGURED};
pub use events::{ChangeKind, EntityChange, IndexingHandler, TEMPORARY_KEY_PREFIX};
pub use filter::{FilterContext, QueryFilters, SearchFilterProvider};
pub use highlight::{HighlightPlan, Highlighter};
pub use index::{
    CurrentTenant, IndexPathResolver, IndexStats, IndexWriterGateway, NoTenant, WriteBatch, WriteSummary,
};
pub use query::{ExpansionKind, MultiSearchQuery, QueryComposer, SearchQuery, TermExpansion};
pub use searcher::{SearcherLease, SearcherLeaseManager};
pub use service::{SearchHit, SearchResponse, SearchService, SearchServiceBuilder, UNKNOWN_INDEX};
pub use sync::{erase_source, EntitySource, ErasedEntitySource, IndexSynchronizer};
pub use uow::{CompletionCallback, CompletionFuture, TransactionScope, UnitOfWork, UnitOfWorkItems};
