//! Region aggregation over in-memory collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use granary_shared::codec::{decode_record_list, InventoryRecordFull};
use granary_shared::types::{SOURCE_TYPE_DARKSTORE, SOURCE_TYPE_MAIN};

use crate::refresh::RegionAggregator;
use crate::tests::mocks::{MockCache, MockRepository};

fn aggregator(repo: &Arc<MockRepository>, cache: &Arc<MockCache>) -> RegionAggregator {
    RegionAggregator::new(repo.clone(), cache.clone())
}

#[tokio::test]
async fn region_max_takes_pickup_quantity_and_lowest_price() {
    let mut repo = MockRepository::new();
    repo.add_binding(1, 100, 10, SOURCE_TYPE_MAIN);
    repo.add_binding(1, 200, 20, SOURCE_TYPE_MAIN);
    repo.no_pickup.insert(1, HashSet::from([200]));
    let repo = Arc::new(repo);
    repo.seed_stock(100, 7, 3, 20000, None);
    repo.seed_stock(200, 7, 9, 15000, None);

    let cache = Arc::new(MockCache::new());

    aggregator(&repo, &cache).refresh_region(&[7], 1).await.unwrap();

    let max = InventoryRecordFull::decode(&cache.field("inventory-max:1", 7).unwrap()).unwrap();
    assert_eq!(max.quantity, 3, "quantity comes from the pickup-enabled Main");
    assert_eq!(max.price, 15000, "price is the minimum across sources");
    assert_eq!(max.store_id, 10);
    assert_eq!(max.source_id, 100);
    assert_eq!(max.source_type, SOURCE_TYPE_MAIN);
    assert!(max.varies);

    assert_eq!(
        cache.field("inventory-last:1", 7),
        cache.field("inventory-max:1", 7),
        "last is a snapshot of best"
    );

    assert_eq!(
        cache.field("inventory-region-st:1", 7).as_deref(),
        Some("10\n"),
        "only pickup-enabled Main stores count"
    );

    let list = decode_record_list(&cache.field("inventory-region:1", 7).unwrap()).unwrap();
    assert_eq!(list.len(), 2);
}

#[tokio::test]
async fn darkstore_overrides_the_first_best_type() {
    let mut repo = MockRepository::new();
    repo.add_binding(2, 300, 30, SOURCE_TYPE_MAIN);
    repo.darkstores.insert(2, HashSet::from([30]));
    let repo = Arc::new(repo);
    repo.seed_stock(300, 9, 5, 10000, None);

    let cache = Arc::new(MockCache::new());

    aggregator(&repo, &cache).refresh_region(&[9], 2).await.unwrap();

    let max = InventoryRecordFull::decode(&cache.field("inventory-max:2", 9).unwrap()).unwrap();
    assert_eq!(max.source_type, SOURCE_TYPE_DARKSTORE);
    assert_eq!(max.quantity, 5);
    assert!(!max.varies);
}

#[tokio::test]
async fn orphans_are_pruned_even_without_changed_products() {
    let mut repo = MockRepository::new();
    repo.add_binding(1, 100, 10, SOURCE_TYPE_MAIN);
    let repo = Arc::new(repo);

    let cache = Arc::new(MockCache::new());
    cache.seed_field("inventory-region:1", 42, "1|1||10|100|0|false|\n");
    cache.seed_field("inventory-region-st:1", 42, "10\n");
    cache.seed_field("inventory-max:1", 42, "1|1||10|100|0|false|");

    aggregator(&repo, &cache).refresh_region(&[], 1).await.unwrap();

    assert!(cache.field("inventory-region:1", 42).is_none());
    assert!(cache.field("inventory-region-st:1", 42).is_none());
    assert!(cache.field("inventory-max:1", 42).is_none());
}

#[tokio::test]
async fn prune_keeps_products_still_in_sql() {
    let mut repo = MockRepository::new();
    repo.add_binding(1, 100, 10, SOURCE_TYPE_MAIN);
    let repo = Arc::new(repo);
    repo.seed_stock(100, 7, 3, 15000, None);

    let cache = Arc::new(MockCache::new());

    let aggregator = aggregator(&repo, &cache);
    aggregator.refresh_region(&[7], 1).await.unwrap();
    cache.seed_field("inventory-max:1", 42, "1|1||10|100|0|false|");
    aggregator.refresh_region(&[], 1).await.unwrap();

    assert!(cache.field("inventory-max:1", 7).is_some());
    assert!(cache.field("inventory-max:1", 42).is_none());
}

#[tokio::test]
async fn region_without_sources_wipes_projections() {
    let repo = Arc::new(MockRepository::new());

    let cache = Arc::new(MockCache::new());
    cache.seed_field("inventory-region:5", 1, "1|1||10|100|0|false|\n");
    cache.seed_field("inventory-region-st:5", 1, "10\n");
    cache.seed_field("inventory-max:5", 1, "1|1||10|100|0|false|");

    aggregator(&repo, &cache).refresh_region(&[1], 5).await.unwrap();

    assert!(cache.hash("inventory-region:5").is_empty());
    assert!(cache.hash("inventory-region-st:5").is_empty());
    assert!(cache.hash("inventory-max:5").is_empty());
}

#[tokio::test]
async fn source_refresh_is_idempotent() {
    let repo = Arc::new(MockRepository::new());
    repo.seed_stock(100, 7, 3, 15000, Some("2024-06-01"));
    repo.seed_stock(100, 8, 2, 40000, None);

    let cache = Arc::new(MockCache::new());

    let aggregator = aggregator(&repo, &cache);
    aggregator.refresh_inventory_source(100).await.unwrap();
    let first = cache.hash("inventory:100");

    aggregator.refresh_inventory_source(100).await.unwrap();
    let second = cache.hash("inventory:100");

    assert_eq!(first, second);
    assert_eq!(second.len(), 2);
    assert_eq!(second[&7], "15000|3|2024-06-01|");
    assert_eq!(second[&8], "40000|2||");
}

#[tokio::test]
async fn source_refresh_replaces_stale_fields() {
    let repo = Arc::new(MockRepository::new());
    repo.seed_stock(100, 8, 2, 40000, None);

    let cache = Arc::new(MockCache::new());
    cache.seed_field("inventory:100", 7, "15000|3|2024-06-01|");

    RegionAggregator::new(repo.clone(), cache.clone())
        .refresh_inventory_source(100)
        .await
        .unwrap();

    assert!(
        cache.field("inventory:100", 7).is_none(),
        "truncate write drops fields no longer in SQL"
    );
    assert!(cache.field("inventory:100", 8).is_some());
}
