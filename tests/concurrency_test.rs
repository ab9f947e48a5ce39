//! Concurrent writers and readers against shared indexes

mod common;

use common::*;
use entity_index_sync::search::*;
use futures::future::join_all;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_document_count_after_concurrent_mutations() {
    let (_dir, service) = create_test_service();
    let service = Arc::new(service);

    let books: Vec<Book> = (0..200)
        .map(|i| Book::new(&format!("Concurrent Lucene {}", i), &format!("C{:03}", i)))
        .collect();

    let inserts = books.iter().cloned().enumerate().map(|(i, book)| {
        let service = service.clone();
        tokio::spawn(async move {
            let handler = service.indexing_handler();
            if i % 2 == 0 {
                handler.handle(EntityChange::created(book), None).await
            } else {
                let scope = TransactionScope::new();
                handler.handle(EntityChange::created(book), Some(&scope)).await?;
                scope.complete().await
            }
        })
    });
    for result in join_all(inserts).await {
        result.unwrap().unwrap();
    }
    assert_eq!(service.document_count("Book").unwrap(), 200);

    // Updates touch 0..60, deletes 160..200
    let updates = books[..60].iter().cloned().map(|mut book| {
        let service = service.clone();
        book.title = format!("{} revised", book.title);
        tokio::spawn(async move {
            let scope = TransactionScope::new();
            service
                .indexing_handler()
                .handle(EntityChange::updated(book), Some(&scope))
                .await?;
            scope.complete().await
        })
    });
    let deletes = books[160..].iter().cloned().map(|book| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .indexing_handler()
                .handle(EntityChange::deleted(book), None)
                .await
        })
    });

    let handles: Vec<_> = updates.chain(deletes).collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(service.document_count("Book").unwrap(), 160);
    let revised = service
        .search("Book", &SearchQuery::new("revised").with_prefix(false).with_take(0))
        .await
        .unwrap();
    assert_eq!(revised.total_hits, 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writers_of_different_indexes_run_side_by_side() {
    let (_dir, service) = create_test_service();
    let service = Arc::new(service);

    let mut handles = Vec::new();
    for i in 0..20 {
        let books = service.clone();
        let authors = service.clone();
        handles.push(tokio::spawn(async move {
            books
                .gateway()
                .index(&Book::new(&format!("Lucene {}", i), &format!("P{:02}", i)))
                .await
                .map(|_| ())
        }));
        handles.push(tokio::spawn(async move {
            authors
                .gateway()
                .index(&Author::new(&format!("Author {}", i), "Writes about Lucene"))
                .await
                .map(|_| ())
        }));
    }
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(service.document_count("Book").unwrap(), 20);
    assert_eq!(service.document_count("Author").unwrap(), 20);

    let response = service
        .search_many(&MultiSearchQuery::new(["Book", "Author"], SearchQuery::new("lucene")))
        .await
        .unwrap();
    assert_eq!(response.total_hits, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_during_writes_release_every_lease() {
    let (_dir, service) = create_test_service();
    let service = Arc::new(service);
    index_books(&service, &sample_books()).await;

    let writer = {
        let service = service.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                service
                    .gateway()
                    .index(&Book::new(&format!("Streaming Lucene {}", i), &format!("S{:02}", i)))
                    .await?;
            }
            Ok::<_, SearchError>(())
        })
    };

    let readers = (0..8).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            let mut last = 0;
            for _ in 0..10 {
                let response = service
                    .search("Book", &SearchQuery::new("lucene").with_take(5))
                    .await?;
                // Committed documents never disappear from later snapshots
                assert!(response.total_hits >= last);
                assert!(response.total_hits >= 3);
                last = response.total_hits;
            }
            Ok::<_, SearchError>(())
        })
    });

    for result in join_all(readers).await {
        result.unwrap().unwrap();
    }
    writer.await.unwrap().unwrap();

    let descriptor = service.model().find("Book").unwrap().clone();
    assert_eq!(service.leases().outstanding(&descriptor), 0);
    assert_eq!(service.document_count("Book").unwrap(), 23);
}
