//! Entity change notifications and the handler that feeds the index

use crate::search::collector::ChangeCollector;
use crate::search::descriptor::{short_type_name, EntityRef};
use crate::search::error::SearchResult;
use crate::search::index::IndexWriterGateway;
use crate::search::uow::UnitOfWork;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Prefix of buffer keys for entities whose id is not assigned yet
pub const TEMPORARY_KEY_PREFIX: &str = "__tmp__";

/// Lifecycle event of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A created, updated or deleted entity
#[derive(Clone)]
pub struct EntityChange {
    pub kind: ChangeKind,
    pub entity: EntityRef,
    type_name: &'static str,
}

impl EntityChange {
    pub fn new<T: Any + Send + Sync>(kind: ChangeKind, entity: T) -> Self {
        Self::from_shared::<T>(kind, Arc::new(entity))
    }

    /// Build from an already shared entity of type `T`
    pub fn from_shared<T: Any + Send + Sync>(kind: ChangeKind, entity: Arc<T>) -> Self {
        Self {
            kind,
            entity,
            type_name: short_type_name::<T>(),
        }
    }

    pub fn created<T: Any + Send + Sync>(entity: T) -> Self {
        Self::new(ChangeKind::Created, entity)
    }

    pub fn updated<T: Any + Send + Sync>(entity: T) -> Self {
        Self::new(ChangeKind::Updated, entity)
    }

    pub fn deleted<T: Any + Send + Sync>(entity: T) -> Self {
        Self::new(ChangeKind::Deleted, entity)
    }

    pub fn entity_type(&self) -> TypeId {
        Any::type_id(&*self.entity)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for EntityChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityChange")
            .field("kind", &self.kind)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Routes entity changes into the unit of work's collector, or writes them at once
pub struct IndexingHandler {
    gateway: Arc<IndexWriterGateway>,
    enabled: bool,
}

impl IndexingHandler {
    pub fn new(gateway: Arc<IndexWriterGateway>, enabled: bool) -> Self {
        Self { gateway, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Handle one change within `uow`, or immediately when no unit of work is active
    pub async fn handle(&self, change: EntityChange, uow: Option<&dyn UnitOfWork>) -> SearchResult<()> {
        self.handle_all(std::iter::once(change), uow).await
    }

    /// Handle several changes that belong to the same unit of work
    pub async fn handle_all<I>(&self, changes: I, uow: Option<&dyn UnitOfWork>) -> SearchResult<()>
    where
        I: IntoIterator<Item = EntityChange>,
    {
        if !self.enabled {
            trace!("Auto indexing disabled, ignoring entity changes");
            return Ok(());
        }

        let uow = uow.filter(|u| u.is_active());
        let collector = match uow {
            Some(uow) => uow
                .items()
                .get_or_insert_with(|| ChangeCollector::new(self.gateway.clone())),
            None => Arc::new(ChangeCollector::new(self.gateway.clone())),
        };

        let mut buffered = 0;
        for change in changes {
            if self.collect(&collector, change) {
                buffered += 1;
            }
        }
        if buffered == 0 {
            return Ok(());
        }

        match uow {
            Some(uow) => {
                collector.register_flush(uow);
                Ok(())
            }
            None => collector.flush().await.map(|_| ()),
        }
    }

    fn collect(&self, collector: &ChangeCollector, change: EntityChange) -> bool {
        let entity_type = change.entity_type();
        let Some(descriptor) = self.gateway.model().get(entity_type) else {
            trace!(entity = change.type_name(), "Entity type not configured for search");
            return false;
        };

        let id = descriptor.entity_id(&*change.entity);
        match change.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                let key = id.unwrap_or_else(|| format!("{}{}", TEMPORARY_KEY_PREFIX, Uuid::new_v4().simple()));
                debug!(index = %descriptor.index_name(), key = %key, kind = %change.kind, "Buffered upsert");
                collector.upsert(entity_type, key, change.entity);
                true
            }
            ChangeKind::Deleted => match id {
                Some(id) => {
                    debug!(index = %descriptor.index_name(), key = %id, "Buffered delete");
                    collector.delete(entity_type, id);
                    true
                }
                None => {
                    debug!(index = %descriptor.index_name(), "Deleted entity has no id, skipping");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::descriptor::SearchModel;
    use crate::search::index::{IndexPathResolver, NoTenant};
    use crate::search::uow::TransactionScope;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct Book {
        id: Uuid,
        title: String,
    }

    struct Unindexed;

    fn book(title: &str) -> Book {
        Book {
            id: Uuid::new_v4(),
            title: title.to_string(),
        }
    }

    fn handler(root: &std::path::Path, enabled: bool) -> IndexingHandler {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id)
                    .field("Title", |b: &Book| b.title.clone(), |f| f.store())
            })
            .unwrap();
        let paths = IndexPathResolver::new(root, false, Arc::new(NoTenant));
        let gateway = Arc::new(IndexWriterGateway::new(Arc::new(model), Arc::new(paths), 50_000_000));
        IndexingHandler::new(gateway, enabled)
    }

    fn count(handler: &IndexingHandler) -> u64 {
        let descriptor = handler.gateway.model().get_for::<Book>().unwrap();
        handler.gateway.stats(descriptor).unwrap().total_documents
    }

    #[test]
    fn test_change_type() {
        let change = EntityChange::created(book("A"));
        assert_eq!(change.entity_type(), TypeId::of::<Book>());
        assert_eq!(change.type_name(), "Book");
        assert_eq!(change.kind.to_string(), "created");
    }

    #[tokio::test]
    async fn test_without_unit_of_work_writes_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), true);

        handler.handle(EntityChange::created(book("A")), None).await.unwrap();
        assert_eq!(count(&handler), 1);
    }

    #[tokio::test]
    async fn test_unit_of_work_defers_until_complete() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), true);
        let scope = TransactionScope::new();

        let entity = book("A");
        handler
            .handle(EntityChange::created(entity.clone()), Some(&scope))
            .await
            .unwrap();
        handler
            .handle(EntityChange::created(book("B")), Some(&scope))
            .await
            .unwrap();
        handler
            .handle(EntityChange::deleted(entity), Some(&scope))
            .await
            .unwrap();
        assert_eq!(count(&handler), 0);
        assert_eq!(scope.items().len(), 1);

        scope.complete().await.unwrap();
        assert_eq!(count(&handler), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_unconfigured_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let disabled = handler(temp_dir.path(), false);
        disabled.handle(EntityChange::created(book("A")), None).await.unwrap();
        assert_eq!(count(&disabled), 0);

        let enabled = handler(temp_dir.path(), true);
        enabled.handle(EntityChange::created(Unindexed), None).await.unwrap();
        assert_eq!(count(&enabled), 0);
    }

    #[tokio::test]
    async fn test_delete_without_id_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), true);
        let mut entity = book("A");
        entity.id = Uuid::nil();
        handler.handle(EntityChange::deleted(entity), None).await.unwrap();
        assert_eq!(count(&handler), 0);
    }

    #[test]
    fn test_new_entities_without_id_do_not_collapse() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), true);
        let collector = ChangeCollector::new(handler.gateway.clone());

        for _ in 0..2 {
            let mut entity = book("Draft");
            entity.id = Uuid::nil();
            assert!(handler.collect(&collector, EntityChange::created(entity)));
        }
        assert_eq!(collector.snapshot().upsert_count(), 2);
    }
}
