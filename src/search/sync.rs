//! Full resynchronization of an index from its entity source

use crate::search::descriptor::{EntityRef, EntitySearchDescriptor};
use crate::search::error::{SearchError, SearchResult};
use crate::search::index::IndexWriterGateway;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Paged enumerator over every persisted entity of type `T`
#[async_trait]
pub trait EntitySource<T>: Send + Sync {
    /// Total number of entities, used for progress reporting
    async fn count(&self) -> SearchResult<usize>;

    /// Entities `[skip, skip + take)` in a stable order
    async fn fetch_page(&self, skip: usize, take: usize) -> SearchResult<Vec<T>>;
}

/// Type-erased view of an [`EntitySource`]
#[async_trait]
pub trait ErasedEntitySource: Send + Sync {
    fn entity_type(&self) -> TypeId;

    async fn count(&self) -> SearchResult<usize>;

    async fn fetch_page(&self, skip: usize, take: usize) -> SearchResult<Vec<EntityRef>>;
}

struct TypedSource<T> {
    inner: Arc<dyn EntitySource<T>>,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: Any + Send + Sync> ErasedEntitySource for TypedSource<T> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    async fn count(&self) -> SearchResult<usize> {
        self.inner.count().await
    }

    async fn fetch_page(&self, skip: usize, take: usize) -> SearchResult<Vec<EntityRef>> {
        let page = self.inner.fetch_page(skip, take).await?;
        Ok(page.into_iter().map(|e| Arc::new(e) as EntityRef).collect())
    }
}

/// Erase the entity type of a source
pub fn erase_source<T: Any + Send + Sync>(source: Arc<dyn EntitySource<T>>) -> Arc<dyn ErasedEntitySource> {
    Arc::new(TypedSource {
        inner: source,
        _entity: PhantomData,
    })
}

/// Streams every entity of a source through the gateway in batches
pub struct IndexSynchronizer {
    gateway: Arc<IndexWriterGateway>,
    default_batch_size: usize,
}

impl IndexSynchronizer {
    pub fn new(gateway: Arc<IndexWriterGateway>, default_batch_size: usize) -> Self {
        Self {
            gateway,
            default_batch_size: default_batch_size.max(1),
        }
    }

    /// Index every entity of `source`; returns how many entities were processed
    ///
    /// `cancel` is checked before each batch. A batch that has started is
    /// always written or failed as a whole.
    pub async fn sync_all(
        &self,
        descriptor: &EntitySearchDescriptor,
        source: &dyn ErasedEntitySource,
        batch_size: Option<usize>,
        replace_first: bool,
        cancel: &CancellationToken,
    ) -> SearchResult<usize> {
        if source.entity_type() != descriptor.entity_type() {
            return Err(SearchError::InvalidConfiguration(format!(
                "source does not produce {} entities",
                descriptor.index_name()
            )));
        }

        let batch_size = batch_size.filter(|&n| n > 0).unwrap_or(self.default_batch_size);
        let started = Instant::now();
        let total = source.count().await.map_err(|e| SearchError::SourceFailed(e.to_string()))?;
        info!(index = %descriptor.index_name(), total, batch_size, "Starting resynchronization");

        if replace_first {
            self.gateway.clear(descriptor).await?;
        }

        let mut processed = 0;
        loop {
            if cancel.is_cancelled() {
                warn!(index = %descriptor.index_name(), processed, "Resynchronization cancelled");
                return Err(SearchError::Cancelled { processed });
            }

            let page = source
                .fetch_page(processed, batch_size)
                .await
                .map_err(|e| SearchError::SourceFailed(e.to_string()))?;
            if page.is_empty() {
                break;
            }

            let fetched = page.len();
            self.gateway.index_entities(descriptor, &page, false).await?;
            processed += fetched;
            debug!(index = %descriptor.index_name(), processed, total, "Synchronized batch");

            if fetched < batch_size {
                break;
            }
        }

        info!(
            index = %descriptor.index_name(),
            processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resynchronization finished"
        );
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::descriptor::SearchModel;
    use crate::search::index::{IndexPathResolver, NoTenant};
    use tempfile::TempDir;

    #[derive(Clone)]
    struct Item {
        id: u64,
        name: String,
        archived: bool,
    }

    struct VecSource(Vec<Item>);

    #[async_trait]
    impl EntitySource<Item> for VecSource {
        async fn count(&self) -> SearchResult<usize> {
            Ok(self.0.len())
        }

        async fn fetch_page(&self, skip: usize, take: usize) -> SearchResult<Vec<Item>> {
            Ok(self.0.iter().skip(skip).take(take).cloned().collect())
        }
    }

    fn items(n: u64) -> Vec<Item> {
        (1..=n)
            .map(|id| Item {
                id,
                name: format!("item {}", id),
                archived: id % 5 == 0,
            })
            .collect()
    }

    fn gateway(root: &std::path::Path) -> Arc<IndexWriterGateway> {
        let mut model = SearchModel::new();
        model
            .entity::<Item, _>(|e| {
                e.id("Id", |i: &Item| i.id)
                    .field("Name", |i: &Item| i.name.clone(), |f| f.store())
                    .exclude_from_index_when(|i: &Item| i.archived)
            })
            .unwrap();
        let paths = IndexPathResolver::new(root, false, Arc::new(NoTenant));
        Arc::new(IndexWriterGateway::new(Arc::new(model), Arc::new(paths), 50_000_000))
    }

    #[tokio::test]
    async fn test_sync_all_in_batches() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(temp_dir.path());
        let descriptor = gateway.model().get_for::<Item>().unwrap().clone();
        let synchronizer = IndexSynchronizer::new(gateway.clone(), 1000);
        let source = erase_source::<Item>(Arc::new(VecSource(items(23))));

        let processed = synchronizer
            .sync_all(&descriptor, source.as_ref(), Some(10), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processed, 23);
        // Every fifth item is archived and excluded
        assert_eq!(gateway.stats(&descriptor).unwrap().total_documents, 19);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(temp_dir.path());
        let descriptor = gateway.model().get_for::<Item>().unwrap().clone();
        let synchronizer = IndexSynchronizer::new(gateway.clone(), 1000);
        let source = erase_source::<Item>(Arc::new(VecSource(items(5))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = synchronizer
            .sync_all(&descriptor, source.as_ref(), None, false, &cancel)
            .await;

        assert!(matches!(result, Err(SearchError::Cancelled { processed: 0 })));
    }

    #[tokio::test]
    async fn test_source_of_wrong_type_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(temp_dir.path());
        let descriptor = gateway.model().get_for::<Item>().unwrap().clone();
        let synchronizer = IndexSynchronizer::new(gateway.clone(), 1000);

        struct Empty;
        #[async_trait]
        impl EntitySource<String> for Empty {
            async fn count(&self) -> SearchResult<usize> {
                Ok(0)
            }
            async fn fetch_page(&self, _skip: usize, _take: usize) -> SearchResult<Vec<String>> {
                Ok(Vec::new())
            }
        }

        let source = erase_source::<String>(Arc::new(Empty));
        let result = synchronizer
            .sync_all(&descriptor, source.as_ref(), None, false, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SearchError::InvalidConfiguration(_))));
    }
}
