//! Unit-of-work boundary consumed by change capture

use crate::search::error::SearchResult;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Future returned by a completion callback
pub type CompletionFuture = BoxFuture<'static, SearchResult<()>>;

/// Callback run once the unit of work has committed
pub type CompletionCallback = Box<dyn FnOnce() -> CompletionFuture + Send>;

/// Transactional boundary after whose commit buffered changes become durable
pub trait UnitOfWork: Send + Sync {
    /// Whether the unit of work is still open
    fn is_active(&self) -> bool;

    /// Register a callback to run after a successful commit
    fn on_completed(&self, callback: CompletionCallback);

    /// Per-unit-of-work storage for collaborators
    fn items(&self) -> &UnitOfWorkItems;
}

/// Typed item bag attached to a unit of work
#[derive(Default)]
pub struct UnitOfWorkItems {
    items: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl UnitOfWorkItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// The item of type `T`, created by `init` on first access
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut items = self.items.lock();
        if let Some(existing) = items
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|item| item.downcast::<T>().ok())
        {
            return existing;
        }

        let item = Arc::new(init());
        items.insert(TypeId::of::<T>(), item.clone());
        item
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let item = self.items.lock().get(&TypeId::of::<T>())?.clone();
        item.downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

struct ScopeState {
    active: bool,
    callbacks: Vec<CompletionCallback>,
}

/// In-memory unit of work
///
/// `complete` runs the registered callbacks in registration order;
/// `rollback` discards them without running any.
pub struct TransactionScope {
    id: Uuid,
    state: Mutex<ScopeState>,
    items: UnitOfWorkItems,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(ScopeState {
                active: true,
                callbacks: Vec::new(),
            }),
            items: UnitOfWorkItems::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Commit: run every callback, returning the first failure
    pub async fn complete(&self) -> SearchResult<()> {
        let callbacks = {
            let mut state = self.state.lock();
            state.active = false;
            std::mem::take(&mut state.callbacks)
        };

        debug!(scope = %self.id, callbacks = callbacks.len(), "Completing unit of work");

        let mut first_error = None;
        for callback in callbacks {
            if let Err(e) = callback().await {
                warn!(scope = %self.id, error = %e, "Completion callback failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abandon the unit of work; no callback runs
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        state.active = false;
        let dropped = std::mem::take(&mut state.callbacks).len();
        debug!(scope = %self.id, dropped, "Rolled back unit of work");
    }
}

impl Default for TransactionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork for TransactionScope {
    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn on_completed(&self, callback: CompletionCallback) {
        let mut state = self.state.lock();
        if !state.active {
            warn!(scope = %self.id, "Callback registered on a finished unit of work is ignored");
            return;
        }
        state.callbacks.push(callback);
    }

    fn items(&self) -> &UnitOfWorkItems {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::error::SearchError;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn callback<F>(future: F) -> CompletionCallback
    where
        F: Future<Output = SearchResult<()>> + Send + 'static,
    {
        Box::new(move || -> CompletionFuture { Box::pin(future) })
    }

    #[test]
    fn test_items_created_once() {
        let items = UnitOfWorkItems::new();
        let created = AtomicUsize::new(0);

        let first = items.get_or_insert_with(|| {
            created.fetch_add(1, Ordering::SeqCst);
            String::from("collector")
        });
        let second = items.get_or_insert_with(|| {
            created.fetch_add(1, Ordering::SeqCst);
            String::from("other")
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(items.get::<String>().as_deref().map(String::as_str), Some("collector"));
        assert!(items.get::<u32>().is_none());
    }

    #[tokio::test]
    async fn test_complete_runs_callbacks_in_order() {
        let scope = TransactionScope::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scope.on_completed(callback(async move {
                order.lock().push(i);
                Ok(())
            }));
        }

        assert!(scope.is_active());
        scope.complete().await.unwrap();
        assert!(!scope.is_active());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_complete_returns_first_error() {
        let scope = TransactionScope::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for message in ["first", "second"] {
            let ran = ran.clone();
            scope.on_completed(callback(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Err(SearchError::IndexingFailed(message.to_string()))
            }));
        }

        let err = scope.complete().await.unwrap_err();
        assert!(err.to_string().contains("first"));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rollback_drops_callbacks() {
        let scope = TransactionScope::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        scope.on_completed(callback(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        scope.rollback();
        scope.complete().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!scope.is_active());
    }
}
