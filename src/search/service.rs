//! Search facade: single and multi-index search, rebuild and resync

use crate::metrics::{SEARCH_QUERIES_TOTAL, SEARCH_QUERY_DURATION_SECONDS};
use crate::search::config::SearchConfig;
use crate::search::descriptor::{EntitySearchDescriptor, SearchModel, SearchScope};
use crate::search::document::{first_text, stored_payload, INDEX_NAME_FIELD};
use crate::search::error::{SearchError, SearchResult};
use crate::search::events::IndexingHandler;
use crate::search::filter::SearchFilterProvider;
use crate::search::highlight::Highlighter;
use crate::search::index::{index_exists, CurrentTenant, IndexPathResolver, IndexStats, IndexWriterGateway, NoTenant};
use crate::search::query::{MultiSearchQuery, QueryComposer, SearchQuery, TermExpansion};
use crate::search::searcher::{SearcherLease, SearcherLeaseManager};
use crate::search::sync::{erase_source, EntitySource, ErasedEntitySource, IndexSynchronizer};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{Bm25StatisticsProvider, Query};
use tantivy::schema::{Field, Schema};
use tantivy::{DocAddress, Searcher, TantivyDocument, Term};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Origin tag of a multi-index hit whose index cannot be determined
pub const UNKNOWN_INDEX: &str = "Unknown";

/// Search result hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Entity id
    pub id: String,

    /// Index the hit came from
    pub index_name: String,

    /// Relevance score
    pub score: f32,

    /// Stored field values
    pub payload: HashMap<String, String>,

    /// Highlighted fragments per stored field
    pub highlights: HashMap<String, Vec<String>>,
}

/// Search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits of the requested page
    pub hits: Vec<SearchHit>,

    /// Total number of matching documents
    pub total_hits: usize,

    /// Query text
    pub query: String,

    /// Search time in milliseconds
    pub search_time_ms: u64,

    /// Ranked hits skipped
    pub skip: usize,

    /// Page size applied
    pub take: usize,
}

impl SearchResponse {
    fn empty(request: &SearchQuery, take: usize, started: Instant) -> Self {
        Self {
            hits: Vec::new(),
            total_hits: 0,
            query: request.query.clone(),
            search_time_ms: started.elapsed().as_millis() as u64,
            skip: request.skip,
            take,
        }
    }
}

/// One leased index taking part in a search
struct Target {
    descriptor: Arc<EntitySearchDescriptor>,
    lease: SearcherLease,
    query: Box<dyn Query>,
    expansions: Vec<TermExpansion>,
}

/// Ranked hit before its stored fields are loaded
struct Ranked {
    score: f32,
    target: usize,
    address: DocAddress,
}

/// BM25 statistics of every index in a multi-index search, summed
///
/// Fields are matched across schemas by name so that a term weighs the
/// same in every index, as if the indexes formed one collection.
struct CombinedStatistics<'a> {
    schema: &'a Schema,
    collection: &'a [(&'a Searcher, &'a Schema)],
}

impl CombinedStatistics<'_> {
    fn same_field(&self, field: Field, other: &Schema) -> Option<Field> {
        other.get_field(self.schema.get_field_name(field)).ok()
    }
}

impl Bm25StatisticsProvider for CombinedStatistics<'_> {
    fn total_num_tokens(&self, field: Field) -> tantivy::Result<u64> {
        let mut total = 0;
        for (searcher, schema) in self.collection {
            if let Some(field) = self.same_field(field, schema) {
                total += Bm25StatisticsProvider::total_num_tokens(*searcher, field)?;
            }
        }
        Ok(total)
    }

    fn total_num_docs(&self) -> tantivy::Result<u64> {
        let mut total = 0;
        for (searcher, _) in self.collection {
            total += Bm25StatisticsProvider::total_num_docs(*searcher)?;
        }
        Ok(total)
    }

    fn doc_freq(&self, term: &Term) -> tantivy::Result<u64> {
        // Only text terms can be rebuilt against another schema
        let value = term.value();
        let Some(text) = value.as_str() else {
            let mut total = 0;
            for (searcher, schema) in self.collection {
                if std::ptr::eq(*schema, self.schema) {
                    total += searcher.doc_freq(term)?;
                }
            }
            return Ok(total);
        };
        let mut total = 0;
        for (searcher, schema) in self.collection {
            if let Some(field) = self.same_field(term.field(), schema) {
                total += searcher.doc_freq(&Term::from_field_text(field, text))?;
            }
        }
        Ok(total)
    }
}

/// Builder for [`SearchService`]
pub struct SearchServiceBuilder {
    config: SearchConfig,
    model: Arc<SearchModel>,
    tenant: Arc<dyn CurrentTenant>,
    providers: Vec<Arc<dyn SearchFilterProvider>>,
}

impl SearchServiceBuilder {
    /// Qualify index paths with the current tenant when `per_tenant_index` is on
    pub fn tenant(mut self, tenant: Arc<dyn CurrentTenant>) -> Self {
        self.tenant = tenant;
        self
    }

    /// Add an ad-hoc filter provider; providers run in registration order
    pub fn filter_provider(mut self, provider: Arc<dyn SearchFilterProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> SearchService {
        let paths = Arc::new(IndexPathResolver::new(
            self.config.index_root.clone(),
            self.config.per_tenant_index,
            self.tenant,
        ));
        let gateway = Arc::new(IndexWriterGateway::new(
            self.model.clone(),
            paths,
            self.config.writer_heap_size,
        ));
        let leases = Arc::new(SearcherLeaseManager::new(gateway.clone()));

        let mut composer = QueryComposer::new(&self.config);
        for provider in self.providers {
            composer.add_provider(provider);
        }

        info!(
            root = %self.config.index_root.display(),
            indexes = self.model.len(),
            filter_providers = composer.providers(),
            "Search service initialized"
        );

        SearchService {
            highlighter: Highlighter::new(self.config.highlight.clone()),
            synchronizer: IndexSynchronizer::new(gateway.clone(), self.config.sync_batch_size),
            indexing: IndexingHandler::new(gateway.clone(), self.config.auto_indexing_enabled),
            sources: DashMap::new(),
            config: self.config,
            model: self.model,
            gateway,
            leases,
            composer,
        }
    }
}

/// Public search facade over every configured index
pub struct SearchService {
    config: SearchConfig,
    model: Arc<SearchModel>,
    gateway: Arc<IndexWriterGateway>,
    leases: Arc<SearcherLeaseManager>,
    composer: QueryComposer,
    highlighter: Highlighter,
    synchronizer: IndexSynchronizer,
    indexing: IndexingHandler,
    sources: DashMap<TypeId, Arc<dyn ErasedEntitySource>>,
}

impl SearchService {
    pub fn builder(config: SearchConfig, model: SearchModel) -> SearchServiceBuilder {
        SearchServiceBuilder {
            config,
            model: Arc::new(model),
            tenant: Arc::new(NoTenant),
            providers: Vec::new(),
        }
    }

    /// Service with no tenant and no ad-hoc filter providers
    pub fn new(config: SearchConfig, model: SearchModel) -> Self {
        Self::builder(config, model).build()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<SearchModel> {
        &self.model
    }

    pub fn gateway(&self) -> &Arc<IndexWriterGateway> {
        &self.gateway
    }

    pub fn leases(&self) -> &Arc<SearcherLeaseManager> {
        &self.leases
    }

    /// Handler to feed entity change notifications into
    pub fn indexing_handler(&self) -> &IndexingHandler {
        &self.indexing
    }

    /// Register the bulk enumerator used by [`SearchService::rebuild_and_resync`]
    pub fn register_source<T: Any + Send + Sync>(&self, source: Arc<dyn EntitySource<T>>) {
        self.sources.insert(TypeId::of::<T>(), erase_source(source));
    }

    fn descriptor(&self, entity_name: &str) -> SearchResult<Arc<EntitySearchDescriptor>> {
        self.model
            .find(entity_name)
            .cloned()
            .ok_or_else(|| SearchError::not_configured(entity_name))
    }

    fn take(&self, request: &SearchQuery) -> usize {
        request.take.unwrap_or(self.config.default_page_size)
    }

    /// Search one index
    pub async fn search(&self, entity_name: &str, request: &SearchQuery) -> SearchResult<SearchResponse> {
        let started = Instant::now();
        let descriptor = self.descriptor(entity_name)?;
        let take = self.take(request);

        let lease = self.leases.acquire(&descriptor).await?;
        let query = self
            .composer
            .compose(lease.index(), &descriptor, entity_name, request, SearchScope::Single)
            .await?;
        let expansions = self.expansions(&lease, &descriptor, request);

        let targets = vec![Target {
            descriptor,
            lease,
            query,
            expansions,
        }];
        let response = self.execute(&targets, request, take, started)?;

        info!(
            entity = %entity_name,
            query = %request.query,
            total = response.total_hits,
            returned = response.hits.len(),
            duration_ms = response.search_time_ms,
            "Search completed"
        );
        self.observe("single", started);
        Ok(response)
    }

    /// Search several indexes and rank all hits in one score order
    ///
    /// Every index is scored with document counts and term frequencies summed
    /// over all requested indexes, matching fields by name. Unknown entity
    /// names and indexes that were never written are skipped.
    pub async fn search_many(&self, request: &MultiSearchQuery) -> SearchResult<SearchResponse> {
        let started = Instant::now();
        if request.entities.is_empty() {
            return Err(SearchError::EmptyEntities);
        }
        let take = self.take(&request.query);

        let mut targets = Vec::with_capacity(request.entities.len());
        for name in &request.entities {
            let Some(descriptor) = self.model.find(name).cloned() else {
                warn!(entity = %name, "Ignored unconfigured entity in multi-index search");
                continue;
            };
            if targets
                .iter()
                .any(|t: &Target| t.descriptor.index_name() == descriptor.index_name())
            {
                continue;
            }
            let path = self.gateway.paths().resolve(descriptor.index_name());
            if !index_exists(&path) {
                info!(index = %descriptor.index_name(), path = %path.display(), "Index not found, skipping");
                continue;
            }

            let lease = self.leases.acquire(&descriptor).await?;
            let query = self
                .composer
                .compose(lease.index(), &descriptor, name, &request.query, SearchScope::Many)
                .await?;
            let expansions = self.expansions(&lease, &descriptor, &request.query);
            targets.push(Target {
                descriptor,
                lease,
                query,
                expansions,
            });
        }

        if targets.is_empty() {
            debug!("No searchable index among requested entities");
            return Ok(SearchResponse::empty(&request.query, take, started));
        }

        let response = self.execute(&targets, &request.query, take, started)?;
        info!(
            indexes = targets.len(),
            query = %request.query.query,
            total = response.total_hits,
            returned = response.hits.len(),
            duration_ms = response.search_time_ms,
            "Multi-index search completed"
        );
        self.observe("many", started);
        Ok(response)
    }

    fn expansions(
        &self,
        lease: &SearcherLease,
        descriptor: &EntitySearchDescriptor,
        request: &SearchQuery,
    ) -> Vec<TermExpansion> {
        if !request.highlight {
            return Vec::new();
        }
        self.composer.expansions(lease.index(), descriptor, request)
    }

    fn observe(&self, kind: &str, started: Instant) {
        SEARCH_QUERIES_TOTAL.with_label_values(&[kind]).inc();
        SEARCH_QUERY_DURATION_SECONDS
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Run the composed queries, merge by score and load the requested window
    fn execute(
        &self,
        targets: &[Target],
        request: &SearchQuery,
        take: usize,
        started: Instant,
    ) -> SearchResult<SearchResponse> {
        let window = request.skip.saturating_add(take);
        let multi = targets.len() > 1;
        let mut total_hits = 0;
        let mut ranked = Vec::new();

        let schemas: Vec<Schema> = targets.iter().map(|t| t.lease.schema()).collect();
        let collection: Vec<(&Searcher, &Schema)> = targets
            .iter()
            .zip(&schemas)
            .map(|(t, schema)| (t.lease.searcher(), schema))
            .collect();

        for (position, target) in targets.iter().enumerate() {
            let searcher = target.lease.searcher();
            if window == 0 {
                total_hits += searcher
                    .search(target.query.as_ref(), &Count)
                    .map_err(|e| SearchError::SearchFailed(e.to_string()))?;
                continue;
            }

            let collector = (TopDocs::with_limit(window), Count);
            let fruit = if multi {
                let statistics = CombinedStatistics {
                    schema: &schemas[position],
                    collection: &collection,
                };
                searcher.search_with_statistics_provider(target.query.as_ref(), &collector, &statistics)
            } else {
                searcher.search(target.query.as_ref(), &collector)
            };
            let (top_docs, count) = fruit.map_err(|e| SearchError::SearchFailed(e.to_string()))?;
            total_hits += count;
            ranked.extend(top_docs.into_iter().map(|(score, address)| Ranked {
                score,
                target: position,
                address,
            }));
        }

        // Stable: equal scores keep the order of the requested indexes
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let descriptors: Vec<&EntitySearchDescriptor> =
            targets.iter().map(|t| t.descriptor.as_ref()).collect();
        let plans: Vec<_> = if request.highlight {
            targets
                .iter()
                .map(|t| {
                    Some(self.highlighter.prepare(
                        t.lease.searcher(),
                        t.query.as_ref(),
                        &t.expansions,
                        &t.lease.schema(),
                        descriptors.iter().copied(),
                    ))
                })
                .collect()
        } else {
            targets.iter().map(|_| None).collect()
        };

        let mut hits = Vec::with_capacity(take.min(ranked.len()));
        for hit in ranked.into_iter().skip(request.skip).take(take) {
            let target = &targets[hit.target];
            let schema = target.lease.schema();
            let doc = load(target.lease.searcher(), hit.address)?;

            let (id, index_name, payload) = if multi {
                let id = descriptors
                    .iter()
                    .filter_map(|d| first_text(&doc, &schema, d.id_field()))
                    .find(|id| !id.is_empty())
                    .unwrap_or_default();
                let mut payload = HashMap::new();
                for descriptor in &descriptors {
                    for (name, value) in stored_payload(descriptor, &schema, &doc) {
                        payload.entry(name).or_insert(value);
                    }
                }
                let origin = resolve_origin(&descriptors, &schema, &doc);
                payload.insert(INDEX_NAME_FIELD.to_string(), origin.clone());
                (id, origin, payload)
            } else {
                let descriptor = &target.descriptor;
                (
                    first_text(&doc, &schema, descriptor.id_field()).unwrap_or_default(),
                    descriptor.index_name().to_string(),
                    stored_payload(descriptor, &schema, &doc),
                )
            };

            let highlights = plans[hit.target]
                .as_ref()
                .map(|plan| plan.apply(&doc))
                .unwrap_or_default();

            hits.push(SearchHit {
                id,
                index_name,
                score: hit.score,
                payload,
                highlights,
            });
        }

        Ok(SearchResponse {
            hits,
            total_hits,
            query: request.query.clone(),
            search_time_ms: started.elapsed().as_millis() as u64,
            skip: request.skip,
            take,
        })
    }

    /// Delete every document of one index; returns the previous live count
    pub async fn rebuild(&self, entity_name: &str) -> SearchResult<u64> {
        let descriptor = self.descriptor(entity_name)?;
        info!(
            index = %descriptor.index_name(),
            path = %self.gateway.paths().resolve(descriptor.index_name()).display(),
            "Rebuilding index"
        );
        self.gateway.clear(&descriptor).await
    }

    /// Delete every document of every configured index
    pub async fn rebuild_all(&self) -> SearchResult<u64> {
        self.gateway.rebuild(None).await
    }

    /// Rebuild an index and re-index every entity of its registered source
    ///
    /// Returns the number of entities processed. Without a registered source
    /// the index is only cleared and its document count is returned.
    pub async fn rebuild_and_resync(
        &self,
        entity_name: &str,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> SearchResult<usize> {
        let descriptor = self.descriptor(entity_name)?;
        self.rebuild(entity_name).await?;

        let source = self
            .sources
            .get(&descriptor.entity_type())
            .map(|entry| entry.value().clone());
        let Some(source) = source else {
            warn!(
                index = %descriptor.index_name(),
                entity = descriptor.type_name(),
                "No entity source registered, index left empty after rebuild"
            );
            return Ok(self.gateway.stats(&descriptor)?.total_documents as usize);
        };

        let processed = self
            .synchronizer
            .sync_all(&descriptor, source.as_ref(), batch_size, false, cancel)
            .await?;
        info!(index = %descriptor.index_name(), processed, "Rebuild and resync completed");
        Ok(processed)
    }

    /// Live documents of an index; zero when the index was never written
    pub fn document_count(&self, entity_name: &str) -> SearchResult<u64> {
        let descriptor = self.descriptor(entity_name)?;
        Ok(self.gateway.stats(&descriptor)?.total_documents)
    }

    pub fn stats(&self, entity_name: &str) -> SearchResult<IndexStats> {
        let descriptor = self.descriptor(entity_name)?;
        self.gateway.stats(&descriptor)
    }

    /// Release cached readers
    pub fn shutdown(&self) {
        self.leases.shutdown();
        info!("Search service shut down");
    }
}

fn load(searcher: &Searcher, address: DocAddress) -> SearchResult<TantivyDocument> {
    searcher
        .doc::<TantivyDocument>(address)
        .map_err(|e| SearchError::SearchFailed(format!("Failed to load document: {}", e)))
}

/// Index a multi-index hit belongs to
///
/// The stored index-name field decides when present. Otherwise the descriptor
/// recognizing the most stored fields of the document wins, ties going to the
/// alphabetically first index name.
fn resolve_origin(descriptors: &[&EntitySearchDescriptor], schema: &Schema, doc: &TantivyDocument) -> String {
    if let Some(stored) = first_text(doc, schema, INDEX_NAME_FIELD) {
        if let Some(descriptor) = descriptors
            .iter()
            .find(|d| d.index_name().eq_ignore_ascii_case(&stored))
        {
            return descriptor.index_name().to_string();
        }
    }

    let mut best: Option<(usize, &str)> = None;
    for descriptor in descriptors {
        let recognized = descriptor
            .stored_fields()
            .filter(|f| first_text(doc, schema, f.name()).is_some())
            .count();
        if recognized == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((count, name)) => recognized > count || (recognized == count && descriptor.index_name() < name),
        };
        if better {
            best = Some((recognized, descriptor.index_name()));
        }
    }

    best.map(|(_, name)| name.to_string())
        .unwrap_or_else(|| UNKNOWN_INDEX.to_string())
}
