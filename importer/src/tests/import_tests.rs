//! End-to-end import cycles over in-memory collaborators.

use std::sync::Arc;

use chrono::NaiveDateTime;

use granary_shared::types::{ChangeDates, UpstreamStock, UPSTREAM_TIME_FORMAT};

use crate::service::ImportService;
use crate::tests::mocks::{MockCache, MockCatalog, MockRepository};

fn ts(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, UPSTREAM_TIME_FORMAT).unwrap()
}

fn upstream(product_id: u64, quantity: u64, price_cents: u64, valid_date: Option<&str>) -> UpstreamStock {
    UpstreamStock {
        product_id,
        quantity,
        price_cents,
        valid_date: valid_date.map(str::to_string),
    }
}

fn change_dates(full: &str, part: &str) -> ChangeDates {
    ChangeDates {
        full_stocks: ts(full),
        part_stocks: ts(part),
    }
}

fn service(
    repo: &Arc<MockRepository>,
    catalog: &Arc<MockCatalog>,
    cache: &Arc<MockCache>,
) -> Arc<ImportService> {
    Arc::new(ImportService::new(
        repo.clone(),
        catalog.clone(),
        cache.clone(),
        // Nothing listens here; the flush is advisory.
        "http://127.0.0.1:9/flush".to_string(),
    ))
}

#[tokio::test]
async fn cold_start_imports_full_stocks() {
    let mut repo = MockRepository::new();
    repo.add_source(1, 100, None);
    let repo = Arc::new(repo);

    let mut catalog = MockCatalog::new();
    catalog
        .change_dates
        .insert(100, change_dates("2024-01-01T00:00:00", "2024-01-01T00:00:00"));
    catalog
        .stocks
        .insert(100, vec![upstream(7, 3, 150, Some("2024-06-01"))]);
    let catalog = Arc::new(catalog);

    let cache = Arc::new(MockCache::new());

    let report = service(&repo, &catalog, &cache).run_cycle().await;
    assert!(report.error.is_none());

    let stock = repo.stock(100, 7).expect("stock reconciled to SQL");
    assert_eq!(stock.qty, 3);
    assert_eq!(stock.price, 15000);
    assert_eq!(stock.valid_date_str(), "2024-06-01");

    assert_eq!(repo.changed_at(100), Some(ts("2024-01-01T00:00:00")));
    assert_eq!(
        cache.field("inventory:100", 7).as_deref(),
        Some("15000|3|2024-06-01|")
    );
    assert_eq!(catalog.stock_calls.lock().unwrap()[0], (100, None));
    assert!(repo.stocks_changed.lock().unwrap().contains(&7));
}

#[tokio::test]
async fn partial_delta_deletes_and_upserts() {
    let mut repo = MockRepository::new();
    repo.add_source(1, 100, Some(ts("2024-01-01T00:00:00")));
    let repo = Arc::new(repo);
    repo.seed_stock(100, 7, 3, 15000, Some("2024-06-01"));

    let mut catalog = MockCatalog::new();
    catalog
        .change_dates
        .insert(100, change_dates("2024-01-01T00:00:00", "2024-01-02T00:00:00"));
    catalog.stocks.insert(
        100,
        vec![upstream(7, 0, 150, None), upstream(8, 2, 400, None)],
    );
    let catalog = Arc::new(catalog);

    let cache = Arc::new(MockCache::new());

    let report = service(&repo, &catalog, &cache).run_cycle().await;
    assert!(report.error.is_none());

    assert!(repo.stock(100, 7).is_none(), "zero-qty product deleted");

    let stock = repo.stock(100, 8).expect("delta product upserted");
    assert_eq!(stock.qty, 2);
    assert_eq!(stock.price, 40000);

    assert_eq!(repo.changed_at(100), Some(ts("2024-01-02T00:00:00")));
    assert_eq!(
        catalog.stock_calls.lock().unwrap()[0],
        (100, Some(ts("2024-01-01T00:00:00"))),
        "delta pull carries the previous high-water mark"
    );
}

#[tokio::test]
async fn full_update_with_empty_stocks_truncates() {
    let mut repo = MockRepository::new();
    repo.add_source(1, 100, Some(ts("2024-01-02T00:00:00")));
    let repo = Arc::new(repo);
    repo.seed_stock(100, 8, 2, 40000, None);

    let mut catalog = MockCatalog::new();
    catalog
        .change_dates
        .insert(100, change_dates("2024-02-01T00:00:00", "2024-02-01T00:00:00"));
    let catalog = Arc::new(catalog);

    let cache = Arc::new(MockCache::new());

    service(&repo, &catalog, &cache).run_cycle().await;

    assert_eq!(repo.stock_count(100), 0);
    assert_eq!(repo.changed_at(100), None, "truncate resets the mark");
}

#[tokio::test]
async fn full_update_deletes_products_missing_upstream() {
    let mut repo = MockRepository::new();
    repo.add_source(1, 100, None);
    let repo = Arc::new(repo);
    repo.seed_stock(100, 7, 3, 15000, None);
    repo.seed_stock(100, 9, 1, 10000, None);

    let mut catalog = MockCatalog::new();
    catalog
        .change_dates
        .insert(100, change_dates("2024-01-01T00:00:00", "2024-01-01T00:00:00"));
    catalog.stocks.insert(100, vec![upstream(7, 5, 150, None)]);
    let catalog = Arc::new(catalog);

    let cache = Arc::new(MockCache::new());

    service(&repo, &catalog, &cache).run_cycle().await;

    assert!(repo.stock(100, 7).is_some());
    assert!(
        repo.stock(100, 9).is_none(),
        "product absent from the full response is reconciled away"
    );
}

#[tokio::test]
async fn failed_source_does_not_stop_siblings_or_advance_its_mark() {
    let mut repo = MockRepository::new();
    repo.add_source(1, 100, None);
    repo.add_source(1, 200, None);
    let repo = Arc::new(repo);

    let mut catalog = MockCatalog::new();
    catalog
        .change_dates
        .insert(100, change_dates("2024-01-01T00:00:00", "2024-01-01T00:00:00"));
    catalog
        .change_dates
        .insert(200, change_dates("2024-01-01T00:00:00", "2024-01-01T00:00:00"));
    catalog.stocks.insert(200, vec![upstream(8, 2, 400, None)]);
    catalog.failing_sources.insert(100);
    let catalog = Arc::new(catalog);

    let cache = Arc::new(MockCache::new());

    let report = service(&repo, &catalog, &cache).run_cycle().await;

    assert_eq!(repo.changed_at(100), None, "failed source keeps its mark");
    assert_eq!(repo.changed_at(200), Some(ts("2024-01-01T00:00:00")));
    assert!(repo.stock(200, 8).is_some());

    let region = &report.regions[0];
    let failed = region
        .sources
        .iter()
        .find(|outcome| outcome.is_id == 100)
        .unwrap();
    assert!(!failed.succeeded());
}
