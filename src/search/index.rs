//! Index locations and the serialized writer gateway

use crate::metrics::{
    SEARCH_DOCUMENTS_DELETED_TOTAL, SEARCH_DOCUMENTS_EXCLUDED_TOTAL, SEARCH_DOCUMENTS_WRITTEN_TOTAL,
    SEARCH_WRITE_DURATION_SECONDS,
};
use crate::search::descriptor::{EntityRef, EntitySearchDescriptor, SearchModel};
use crate::search::document::{build_schema, id_term, DocumentProjector};
use crate::search::error::{SearchError, SearchResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tantivy::directory::MmapDirectory;
use tantivy::schema::Schema;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info};

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    /// Index name
    pub index_name: String,

    /// Total number of live documents in the index
    pub total_documents: u64,

    /// Index size in bytes
    pub index_size_bytes: u64,

    /// Number of segments
    pub num_segments: usize,

    /// Last commit made through this gateway
    pub last_commit: Option<chrono::DateTime<chrono::Utc>>,
}

/// Source of the tenant an index path is qualified with
pub trait CurrentTenant: Send + Sync {
    fn tenant_id(&self) -> Option<String>;
}

/// Single-tenant host
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTenant;

impl CurrentTenant for NoTenant {
    fn tenant_id(&self) -> Option<String> {
        None
    }
}

/// Maps index names onto directories
pub struct IndexPathResolver {
    root: PathBuf,
    per_tenant: bool,
    tenant: Arc<dyn CurrentTenant>,
}

impl IndexPathResolver {
    pub fn new(root: impl Into<PathBuf>, per_tenant: bool, tenant: Arc<dyn CurrentTenant>) -> Self {
        Self {
            root: root.into(),
            per_tenant,
            tenant,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<index>`, or `<root>/<tenant>/<index>` when a tenant is current
    pub fn resolve(&self, index_name: &str) -> PathBuf {
        let mut path = self.root.clone();
        if self.per_tenant {
            if let Some(tenant) = self.tenant.tenant_id().filter(|t| !t.trim().is_empty()) {
                path.push(tenant.trim());
            }
        }
        path.push(index_name);
        normalize(&path)
    }
}

/// Lexically normalized path used as the key of per-index state
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Check if an index has been committed at the given path
pub fn index_exists(path: &Path) -> bool {
    path.join("meta.json").exists()
}

/// Whether the directory exists and holds at least one entry
pub fn has_files(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Open the index at `path`, creating directory and index when missing
pub fn open_or_create(path: &Path, schema: Schema) -> SearchResult<Index> {
    std::fs::create_dir_all(path).map_err(|e| {
        SearchError::IndexInitFailed(format!(
            "Failed to create index directory {}: {}",
            path.display(),
            e
        ))
    })?;
    let directory = MmapDirectory::open(path)?;
    Index::open_or_create(directory, schema).map_err(|e| {
        SearchError::IndexInitFailed(format!("Failed to open index {}: {}", path.display(), e))
    })
}

/// Run engine work that blocks on disk or merge threads off the async workers
async fn blocking<R, F>(work: F) -> SearchResult<R>
where
    F: FnOnce() -> SearchResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SearchError::IndexingFailed(format!("Writer task failed: {}", e)))?
}

/// Outcome of a write batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Documents upserted
    pub indexed: usize,

    /// Entities turned into deletes by an exclusion predicate
    pub excluded: usize,

    /// Delete terms issued
    pub deleted: usize,
}

/// Open writer handed to a gateway action
pub struct WriteBatch<'a> {
    writer: &'a mut IndexWriter,
    descriptor: &'a EntitySearchDescriptor,
    schema: Schema,
    summary: WriteSummary,
}

impl<'a> WriteBatch<'a> {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn descriptor(&self) -> &EntitySearchDescriptor {
        self.descriptor
    }

    /// Insert or replace the document with the given id
    pub fn upsert_document(&mut self, id: &str, document: TantivyDocument) -> SearchResult<()> {
        let term = id_term(self.descriptor, &self.schema, id)?;
        self.writer.delete_term(term);
        self.writer
            .add_document(document)
            .map_err(|e| SearchError::IndexingFailed(format!("Failed to add document {}: {}", id, e)))?;
        self.summary.indexed += 1;
        Ok(())
    }

    /// Project and upsert an entity, or delete it when an exclusion matches
    pub fn upsert_entity(&mut self, entity: &dyn Any) -> SearchResult<()> {
        if self.descriptor.is_excluded(entity) {
            if let Some(id) = self.descriptor.entity_id(entity) {
                self.delete_id(&id)?;
            }
            self.summary.excluded += 1;
            return Ok(());
        }

        let projected = DocumentProjector::new(self.descriptor, &self.schema).project(entity)?;
        self.upsert_document(&projected.id, projected.document)
    }

    pub fn delete_id(&mut self, id: &str) -> SearchResult<()> {
        let term = id_term(self.descriptor, &self.schema, id)?;
        self.delete(term);
        Ok(())
    }

    /// Delete every document whose field holds exactly `value`
    pub fn delete_field_value(&mut self, field: &str, value: &str) -> SearchResult<()> {
        let field = self
            .schema
            .get_field(field)
            .map_err(|e| SearchError::SchemaError(e.to_string()))?;
        self.delete(Term::from_field_text(field, value));
        Ok(())
    }

    pub fn delete_all(&mut self) -> SearchResult<()> {
        self.writer
            .delete_all_documents()
            .map_err(|e| SearchError::DeletionFailed(format!("Failed to clear index: {}", e)))?;
        Ok(())
    }

    fn delete(&mut self, term: Term) {
        self.writer.delete_term(term);
        self.summary.deleted += 1;
    }
}

/// Serializes writers per physical index and applies write batches
pub struct IndexWriterGateway {
    model: Arc<SearchModel>,
    paths: Arc<IndexPathResolver>,
    writer_heap_size: usize,
    gates: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    last_commits: DashMap<PathBuf, chrono::DateTime<chrono::Utc>>,
}

impl IndexWriterGateway {
    pub fn new(model: Arc<SearchModel>, paths: Arc<IndexPathResolver>, writer_heap_size: usize) -> Self {
        Self {
            model,
            paths,
            writer_heap_size,
            gates: DashMap::new(),
            last_commits: DashMap::new(),
        }
    }

    pub fn model(&self) -> &Arc<SearchModel> {
        &self.model
    }

    pub fn paths(&self) -> &Arc<IndexPathResolver> {
        &self.paths
    }

    fn gate(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                debug!(path = %path.display(), "Creating write gate");
                Arc::new(tokio::sync::Mutex::new(()))
            })
            .clone()
    }

    fn descriptor_for(&self, entity_type: TypeId) -> SearchResult<Arc<EntitySearchDescriptor>> {
        self.model
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SearchError::not_configured(format!("{:?}", entity_type)))
    }

    fn descriptor_of<T: Any>(&self) -> SearchResult<Arc<EntitySearchDescriptor>> {
        self.model
            .get_for::<T>()
            .cloned()
            .ok_or_else(|| SearchError::not_configured(std::any::type_name::<T>()))
    }

    /// Run `action` against an open writer of the descriptor's index and commit
    ///
    /// Callers of the same index wait for each other; different indexes
    /// proceed in parallel. If `action` fails nothing is committed. Opening,
    /// committing and merging run on the blocking pool.
    pub async fn write<F, R>(&self, descriptor: &EntitySearchDescriptor, action: F) -> SearchResult<(R, WriteSummary)>
    where
        F: FnOnce(&mut WriteBatch<'_>) -> SearchResult<R> + Send,
    {
        let path = self.paths.resolve(descriptor.index_name());
        let gate = self.gate(&path);
        let _guard = gate.lock().await;

        let started = Instant::now();
        let (index, mut writer) = {
            let path = path.clone();
            let schema = build_schema(descriptor);
            let heap_size = self.writer_heap_size;
            blocking(move || {
                let index = open_or_create(&path, schema)?;
                let writer: IndexWriter = index
                    .writer(heap_size)
                    .map_err(|e| SearchError::IndexInitFailed(format!("Failed to create writer: {}", e)))?;
                Ok((index, writer))
            })
            .await?
        };

        let outcome = {
            let mut batch = WriteBatch {
                writer: &mut writer,
                descriptor,
                schema: index.schema(),
                summary: WriteSummary::default(),
            };
            action(&mut batch).map(|result| (result, batch.summary))
        };
        let (result, summary) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Dropping the writer discards the batch and frees the directory lock
                blocking(move || {
                    drop(writer);
                    Ok(())
                })
                .await?;
                return Err(e);
            }
        };

        blocking(move || {
            writer
                .commit()
                .map_err(|e| SearchError::IndexingFailed(format!("Failed to commit: {}", e)))?;
            writer
                .wait_merging_threads()
                .map_err(|e| SearchError::IndexingFailed(format!("Failed to release writer: {}", e)))
        })
        .await?;
        self.last_commits.insert(path.clone(), chrono::Utc::now());

        let index_name = descriptor.index_name();
        SEARCH_DOCUMENTS_WRITTEN_TOTAL
            .with_label_values(&[index_name])
            .inc_by(summary.indexed as u64);
        SEARCH_DOCUMENTS_DELETED_TOTAL
            .with_label_values(&[index_name])
            .inc_by(summary.deleted as u64);
        SEARCH_DOCUMENTS_EXCLUDED_TOTAL
            .with_label_values(&[index_name])
            .inc_by(summary.excluded as u64);
        SEARCH_WRITE_DURATION_SECONDS
            .with_label_values(&[index_name])
            .observe(started.elapsed().as_secs_f64());

        debug!(
            index = %index_name,
            indexed = summary.indexed,
            excluded = summary.excluded,
            deleted = summary.deleted,
            "Committed write batch"
        );

        Ok((result, summary))
    }

    /// Make sure a committed index exists at the descriptor's path
    pub async fn ensure_initialized(&self, descriptor: &EntitySearchDescriptor) -> SearchResult<Index> {
        let path = self.paths.resolve(descriptor.index_name());
        if index_exists(&path) {
            return open_or_create(&path, build_schema(descriptor));
        }

        self.write(descriptor, |_| Ok(())).await?;
        info!(index = %descriptor.index_name(), path = %path.display(), "Initialized empty index");
        open_or_create(&path, build_schema(descriptor))
    }

    /// Upsert a single entity
    pub async fn index<T: Any + Send + Sync>(&self, entity: &T) -> SearchResult<WriteSummary> {
        self.index_range(std::slice::from_ref(entity), false).await
    }

    /// Upsert a batch of entities, optionally replacing the whole index
    pub async fn index_range<T: Any + Send + Sync>(&self, entities: &[T], replace: bool) -> SearchResult<WriteSummary> {
        let descriptor = self.descriptor_of::<T>()?;
        let entities: Vec<&(dyn Any + Send + Sync)> = entities
            .iter()
            .map(|e| e as &(dyn Any + Send + Sync))
            .collect();
        self.write_entities(&descriptor, entities, replace).await
    }

    /// Upsert a batch of type-erased entities of the descriptor's type
    pub async fn index_entities(
        &self,
        descriptor: &EntitySearchDescriptor,
        entities: &[EntityRef],
        replace: bool,
    ) -> SearchResult<WriteSummary> {
        let entities: Vec<&(dyn Any + Send + Sync)> = entities.iter().map(|e| &**e).collect();
        self.write_entities(descriptor, entities, replace).await
    }

    async fn write_entities(
        &self,
        descriptor: &EntitySearchDescriptor,
        entities: Vec<&(dyn Any + Send + Sync)>,
        replace: bool,
    ) -> SearchResult<WriteSummary> {
        if entities.is_empty() && !replace {
            return Ok(WriteSummary::default());
        }

        let ((), summary) = self
            .write(descriptor, move |batch| {
                if replace {
                    batch.delete_all()?;
                }
                for entity in entities {
                    batch.upsert_entity(entity)?;
                }
                Ok(())
            })
            .await?;
        Ok(summary)
    }

    /// Upsert prebuilt documents; each must carry the descriptor's id field
    pub async fn index_documents(
        &self,
        descriptor: &EntitySearchDescriptor,
        documents: Vec<TantivyDocument>,
        replace: bool,
    ) -> SearchResult<WriteSummary> {
        let ((), summary) = self
            .write(descriptor, move |batch| {
                if replace {
                    batch.delete_all()?;
                }
                for document in documents {
                    let id = crate::search::document::first_text(
                        &document,
                        batch.schema(),
                        batch.descriptor().id_field(),
                    )
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| {
                        SearchError::IndexingFailed(format!(
                            "document without value for id field {}",
                            batch.descriptor().id_field()
                        ))
                    })?;
                    batch.upsert_document(&id, document)?;
                }
                Ok(())
            })
            .await?;
        Ok(summary)
    }

    /// Delete one entity of type `T` by id
    pub async fn delete<T: Any>(&self, id: &str) -> SearchResult<WriteSummary> {
        let descriptor = self.descriptor_of::<T>()?;
        self.delete_ids(&descriptor, &[id.to_string()]).await
    }

    /// Delete entities of type `T` by id
    pub async fn delete_range<T: Any>(&self, ids: &[String]) -> SearchResult<WriteSummary> {
        let descriptor = self.descriptor_of::<T>()?;
        self.delete_ids(&descriptor, ids).await
    }

    /// Delete documents of the descriptor's index by id
    pub async fn delete_ids(&self, descriptor: &EntitySearchDescriptor, ids: &[String]) -> SearchResult<WriteSummary> {
        if ids.is_empty() {
            return Ok(WriteSummary::default());
        }
        let ((), summary) = self
            .write(descriptor, |batch| {
                for id in ids {
                    batch.delete_id(id)?;
                }
                Ok(())
            })
            .await?;
        Ok(summary)
    }

    /// Delete every document whose `field` holds one of `values`
    pub async fn delete_by_field(
        &self,
        descriptor: &EntitySearchDescriptor,
        field: &str,
        values: &[String],
    ) -> SearchResult<WriteSummary> {
        let values: Vec<&String> = values.iter().filter(|v| !v.trim().is_empty()).collect();
        if values.is_empty() {
            return Ok(WriteSummary::default());
        }
        let ((), summary) = self
            .write(descriptor, |batch| {
                for value in &values {
                    batch.delete_field_value(field, value)?;
                }
                Ok(())
            })
            .await?;
        Ok(summary)
    }

    /// Delete all documents of one index and return how many were live before
    pub async fn clear(&self, descriptor: &EntitySearchDescriptor) -> SearchResult<u64> {
        let (previous, _) = self
            .write(descriptor, |batch| {
                let previous = live_documents(batch.writer.index())?;
                batch.delete_all()?;
                Ok(previous)
            })
            .await?;
        info!(index = %descriptor.index_name(), previous, "Cleared index");
        Ok(previous)
    }

    /// Clear the index of `entity_type`, or of every configured entity when `None`
    pub async fn rebuild(&self, entity_type: Option<TypeId>) -> SearchResult<u64> {
        let descriptors: Vec<Arc<EntitySearchDescriptor>> = match entity_type {
            Some(entity_type) => vec![self.descriptor_for(entity_type)?],
            None => self.model.descriptors().to_vec(),
        };

        let mut previous = 0;
        for descriptor in descriptors {
            previous += self.clear(&descriptor).await?;
        }
        Ok(previous)
    }

    /// Statistics of one index; an index never written reports zeros
    pub fn stats(&self, descriptor: &EntitySearchDescriptor) -> SearchResult<IndexStats> {
        let path = self.paths.resolve(descriptor.index_name());
        let last_commit = self.last_commits.get(&path).map(|entry| *entry.value());
        if !index_exists(&path) {
            return Ok(IndexStats {
                index_name: descriptor.index_name().to_string(),
                total_documents: 0,
                index_size_bytes: 0,
                num_segments: 0,
                last_commit,
            });
        }

        let index = Index::open_in_dir(&path)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let searcher = reader.searcher();

        let index_size_bytes = std::fs::read_dir(&path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0);

        Ok(IndexStats {
            index_name: descriptor.index_name().to_string(),
            total_documents: searcher.num_docs(),
            index_size_bytes,
            num_segments: searcher.segment_readers().len(),
            last_commit,
        })
    }
}

/// Live document count of the last commit of an index
pub fn live_documents(index: &Index) -> SearchResult<u64> {
    let reader: IndexReader = index
        .reader_builder()
        .reload_policy(ReloadPolicy::Manual)
        .try_into()?;
    Ok(reader.searcher().num_docs())
}
