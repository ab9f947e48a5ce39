//! Per-unit-of-work buffer of pending index changes
//!
//! Mutations observed while a unit of work is open are collapsed per
//! (entity type, key) and written in one batch per entity type after the
//! unit of work commits. A key that is both upserted and deleted in the same
//! unit of work ends up deleted.

use crate::metrics::SEARCH_FLUSHES_TOTAL;
use crate::search::descriptor::EntityRef;
use crate::search::error::{SearchError, SearchResult};
use crate::search::index::IndexWriterGateway;
use crate::search::uow::{CompletionFuture, UnitOfWork};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Buffered upserts and deletes
#[derive(Default, Clone)]
pub struct PendingChanges {
    upserts: HashMap<TypeId, HashMap<String, EntityRef>>,
    deletes: HashMap<TypeId, HashSet<String>>,
}

impl PendingChanges {
    /// Record an upsert; a later upsert of the same key replaces it
    pub fn upsert(&mut self, entity_type: TypeId, key: String, entity: EntityRef) {
        self.upserts.entry(entity_type).or_default().insert(key, entity);
    }

    pub fn delete(&mut self, entity_type: TypeId, key: String) {
        self.deletes.entry(entity_type).or_default().insert(key);
    }

    /// Drop every pending upsert whose key is also pending deletion
    pub fn resolve(mut self) -> Self {
        for (entity_type, keys) in &self.deletes {
            if let Some(upserts) = self.upserts.get_mut(entity_type) {
                upserts.retain(|key, _| !keys.contains(key));
            }
        }
        self.upserts.retain(|_, upserts| !upserts.is_empty());
        self.deletes.retain(|_, keys| !keys.is_empty());
        self
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.values().map(HashMap::len).sum()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.upsert_count() == 0 && self.delete_count() == 0
    }

    pub fn is_upsert_pending(&self, entity_type: TypeId, key: &str) -> bool {
        self.upserts
            .get(&entity_type)
            .map(|upserts| upserts.contains_key(key))
            .unwrap_or(false)
    }

    pub fn is_delete_pending(&self, entity_type: TypeId, key: &str) -> bool {
        self.deletes
            .get(&entity_type)
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }
}

/// Outcome of a successful flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub upserted: usize,
    pub deleted: usize,
    pub batches: usize,
}

/// Collects entity changes and flushes them through the writer gateway
pub struct ChangeCollector {
    gateway: Arc<IndexWriterGateway>,
    pending: Mutex<PendingChanges>,
    registered: AtomicBool,
}

impl ChangeCollector {
    pub fn new(gateway: Arc<IndexWriterGateway>) -> Self {
        Self {
            gateway,
            pending: Mutex::new(PendingChanges::default()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn upsert(&self, entity_type: TypeId, key: impl Into<String>, entity: EntityRef) {
        self.pending.lock().upsert(entity_type, key.into(), entity);
    }

    pub fn delete(&self, entity_type: TypeId, key: impl Into<String>) {
        self.pending.lock().delete(entity_type, key.into());
    }

    /// Copy of the buffered changes
    pub fn snapshot(&self) -> PendingChanges {
        self.pending.lock().clone()
    }

    /// Whether a flush callback is registered and has not run yet
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Register the post-commit flush; only the first call per unit of work registers
    pub fn register_flush(self: &Arc<Self>, uow: &dyn UnitOfWork) -> bool {
        if self.registered.swap(true, Ordering::AcqRel) {
            trace!("Flush already registered for this unit of work");
            return false;
        }

        let collector = Arc::clone(self);
        uow.on_completed(Box::new(move || -> CompletionFuture {
            Box::pin(async move { collector.flush().await.map(|_| ()) })
        }));
        true
    }

    /// Write every buffered change now
    ///
    /// All batches are attempted. The buffer is cleared and the registration
    /// reset afterwards whether or not a batch failed; failures are reported
    /// together as [`SearchError::FlushFailed`].
    pub async fn flush(&self) -> SearchResult<FlushSummary> {
        let changes = self.snapshot().resolve();
        let result = self.write(changes).await;

        *self.pending.lock() = PendingChanges::default();
        self.registered.store(false, Ordering::Release);

        match &result {
            Ok(summary) => {
                SEARCH_FLUSHES_TOTAL.with_label_values(&["success"]).inc();
                if summary.batches > 0 {
                    info!(
                        upserted = summary.upserted,
                        deleted = summary.deleted,
                        batches = summary.batches,
                        "Flushed index changes"
                    );
                }
            }
            Err(e) => {
                SEARCH_FLUSHES_TOTAL.with_label_values(&["failure"]).inc();
                error!(error = %e, "Index flush failed");
            }
        }
        result
    }

    async fn write(&self, changes: PendingChanges) -> SearchResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        let mut failures = Vec::new();
        let model = self.gateway.model();

        for (entity_type, upserts) in changes.upserts {
            let Some(descriptor) = model.get(entity_type) else {
                warn!(?entity_type, "Dropping upserts of an unconfigured entity type");
                continue;
            };
            let entities: Vec<EntityRef> = upserts.into_values().collect();
            debug!(index = %descriptor.index_name(), count = entities.len(), "Writing upsert batch");
            summary.batches += 1;
            match self.gateway.index_entities(descriptor, &entities, false).await {
                Ok(_) => summary.upserted += entities.len(),
                Err(e) => failures.push(format!("{} upserts: {}", descriptor.index_name(), e)),
            }
        }

        for (entity_type, keys) in changes.deletes {
            let Some(descriptor) = model.get(entity_type) else {
                warn!(?entity_type, "Dropping deletes of an unconfigured entity type");
                continue;
            };
            let ids: Vec<String> = keys.into_iter().collect();
            debug!(index = %descriptor.index_name(), count = ids.len(), "Writing delete batch");
            summary.batches += 1;
            match self.gateway.delete_ids(descriptor, &ids).await {
                Ok(_) => summary.deleted += ids.len(),
                Err(e) => failures.push(format!("{} deletes: {}", descriptor.index_name(), e)),
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(SearchError::FlushFailed { failures })
        }
    }
}
