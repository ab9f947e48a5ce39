//! Long-lived readers and leased searchers
//!
//! One reader is kept per physical index path. Every acquisition asks the
//! reader to pick up the latest commit and hands out a [`SearcherLease`]
//! bound to the snapshot visible at that moment. Leases taken before a
//! refresh keep their own snapshot until they are released.

use crate::metrics::SEARCH_LEASES_OUTSTANDING;
use crate::search::descriptor::EntitySearchDescriptor;
use crate::search::error::{SearchError, SearchResult};
use crate::search::index::IndexWriterGateway;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tantivy::schema::Schema;
use tantivy::{Index, IndexReader, ReloadPolicy, Searcher};
use tracing::{debug, info};

/// Cached reader of one index path
struct ReaderEntry {
    path: PathBuf,
    index_name: String,
    index: Index,
    reader: IndexReader,
    outstanding: AtomicUsize,
}

impl ReaderEntry {
    fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        SEARCH_LEASES_OUTSTANDING
            .with_label_values(&[self.index_name.as_str()])
            .dec();
    }
}

/// A searcher bound to one index snapshot
///
/// Released when dropped; [`SearcherLease::release`] does the same eagerly.
pub struct SearcherLease {
    entry: Arc<ReaderEntry>,
    searcher: Searcher,
    released: bool,
}

impl SearcherLease {
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn index(&self) -> &Index {
        &self.entry.index
    }

    pub fn schema(&self) -> Schema {
        self.entry.index.schema()
    }

    pub fn index_name(&self) -> &str {
        &self.entry.index_name
    }

    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    /// Give the lease back; calling it more than once has no further effect
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.entry.release();
        }
    }
}

impl Drop for SearcherLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hands out leased searchers, one cached reader per index path
pub struct SearcherLeaseManager {
    gateway: Arc<IndexWriterGateway>,
    entries: DashMap<PathBuf, Arc<ReaderEntry>>,
}

impl SearcherLeaseManager {
    pub fn new(gateway: Arc<IndexWriterGateway>) -> Self {
        Self {
            gateway,
            entries: DashMap::new(),
        }
    }

    /// Lease a searcher over the latest visible commit of the descriptor's index
    pub async fn acquire(&self, descriptor: &EntitySearchDescriptor) -> SearchResult<SearcherLease> {
        let entry = self.entry(descriptor).await?;

        if let Err(e) = entry.reader.reload() {
            debug!(index = %entry.index_name, error = %e, "Reader refresh failed, serving previous snapshot");
        }

        let searcher = entry.reader.searcher();
        entry.outstanding.fetch_add(1, Ordering::AcqRel);
        SEARCH_LEASES_OUTSTANDING
            .with_label_values(&[entry.index_name.as_str()])
            .inc();

        Ok(SearcherLease {
            entry,
            searcher,
            released: false,
        })
    }

    async fn entry(&self, descriptor: &EntitySearchDescriptor) -> SearchResult<Arc<ReaderEntry>> {
        let path = self.gateway.paths().resolve(descriptor.index_name());
        if let Some(entry) = self.entries.get(&path) {
            return Ok(entry.clone());
        }

        // Miss: initialize outside the map so no shard lock is held across await
        let index = self.gateway.ensure_initialized(descriptor).await?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| SearchError::IndexInitFailed(format!("Failed to create reader: {}", e)))?;

        let entry = self
            .entries
            .entry(path.clone())
            .or_insert_with(|| {
                info!(index = %descriptor.index_name(), path = %path.display(), "Opened index reader");
                Arc::new(ReaderEntry {
                    path: path.clone(),
                    index_name: descriptor.index_name().to_string(),
                    index,
                    reader,
                    outstanding: AtomicUsize::new(0),
                })
            })
            .clone();
        Ok(entry)
    }

    /// Leases of the descriptor's index that are not yet released
    pub fn outstanding(&self, descriptor: &EntitySearchDescriptor) -> usize {
        let path = self.gateway.paths().resolve(descriptor.index_name());
        self.entries
            .get(&path)
            .map(|entry| entry.outstanding.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of cached readers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached reader; outstanding leases stay valid until released
    pub fn shutdown(&self) {
        let count = self.entries.len();
        self.entries.clear();
        info!(readers = count, "Searcher lease manager shut down");
    }
}
