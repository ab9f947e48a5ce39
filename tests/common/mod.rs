//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use entity_index_sync::search::*;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub code: String,
    pub summary: String,
    pub group: String,
    pub archived: bool,
}

impl Book {
    pub fn new(title: &str, code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            code: code.to_string(),
            summary: format!("{} is a book about search", title),
            group: "public".to_string(),
            archived: false,
        }
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }
}

#[derive(Debug, Clone)]
pub struct Author {
    pub id: Uuid,
    pub name: String,
    pub bio: String,
}

impl Author {
    pub fn new(name: &str, bio: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            bio: bio.to_string(),
        }
    }
}

/// The three books every search scenario starts from
pub fn sample_books() -> Vec<Book> {
    vec![
        Book::new("Lucene in Action", "B001"),
        Book::new("Pro .NET Lucene", "B002"),
        Book::new("Another Lucene Book", "B003"),
    ]
}

pub fn configure_books(model: &mut SearchModel) {
    model
        .entity::<Book, _>(|e| {
            e.id("Id", |b: &Book| b.id)
                .field("Title", |b: &Book| b.title.clone(), |f| f.store().boost(2.0))
                .field("Code", |b: &Book| b.code.clone(), |f| f.keyword().store())
                .field("Summary", |b: &Book| b.summary.clone(), |f| f.store())
                .field("Group", |b: &Book| b.group.clone(), |f| f.keyword().not_searchable())
                .exclude_from_index_when(|b: &Book| b.archived)
        })
        .unwrap();
}

pub fn configure_authors(model: &mut SearchModel) {
    model
        .entity::<Author, _>(|e| {
            e.id("Id", |a: &Author| a.id)
                .field("Name", |a: &Author| a.name.clone(), |f| f.store())
                .field("Bio", |a: &Author| a.bio.clone(), |f| f.store())
        })
        .unwrap();
}

pub fn default_model() -> SearchModel {
    let mut model = SearchModel::new();
    configure_books(&mut model);
    configure_authors(&mut model);
    model
}

pub fn test_config(temp_dir: &TempDir) -> SearchConfig {
    SearchConfigBuilder::new()
        .index_root(temp_dir.path())
        .writer_heap_size(50_000_000)
        .build()
}

/// Service over a fresh index root; keep the `TempDir` alive for the test
pub fn create_test_service() -> (TempDir, SearchService) {
    let temp_dir = TempDir::new().unwrap();
    let service = SearchService::new(test_config(&temp_dir), default_model());
    (temp_dir, service)
}

pub async fn index_books(service: &SearchService, books: &[Book]) {
    service.gateway().index_range(books, false).await.unwrap();
}

/// In-memory bulk source
pub struct VecSource<T>(pub Vec<T>);

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EntitySource<T> for VecSource<T> {
    async fn count(&self) -> SearchResult<usize> {
        Ok(self.0.len())
    }

    async fn fetch_page(&self, skip: usize, take: usize) -> SearchResult<Vec<T>> {
        Ok(self.0.iter().skip(skip).take(take).cloned().collect())
    }
}

pub fn book_source(books: Vec<Book>) -> Arc<dyn EntitySource<Book>> {
    Arc::new(VecSource(books))
}
