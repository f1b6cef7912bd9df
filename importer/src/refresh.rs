//! Region aggregation engine.
//!
//! Rebuilds the derived cache views from the reconciled SQL stocks: the
//! per-source hash, and per region the list, pickup store-set, best-variant
//! and last-seen projections, followed by a prune of product keys no longer
//! backed by SQL.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::TryStreamExt;

use granary_shared::cache::InventoryCache;
use granary_shared::codec::{InventoryRecord, InventoryRecordFull};
use granary_shared::repository::InventoryRepository;
use granary_shared::types::{SOURCE_TYPE_DARKSTORE, SOURCE_TYPE_MAIN};
use granary_shared::Result;

/// Paging sizes for the stock streams.
const SOURCE_STREAM_CHUNK: u64 = 10_000;
const REGION_STREAM_CHUNK: u64 = 5_000;

/// Region projections are rebuilt in product-id chunks of this size.
const PRODUCT_CHUNK: usize = 100;

pub struct RegionAggregator {
    repository: Arc<dyn InventoryRepository>,
    cache: Arc<dyn InventoryCache>,
}

impl RegionAggregator {
    pub fn new(repository: Arc<dyn InventoryRepository>, cache: Arc<dyn InventoryCache>) -> Self {
        Self { repository, cache }
    }

    /// Re-encodes every stock of the source and atomically replaces its
    /// cache hash.
    pub async fn refresh_inventory_source(&self, is_id: u64) -> Result<()> {
        let mut stream = self
            .repository
            .stream_stocks(&[is_id], &[], SOURCE_STREAM_CHUNK)?;

        let mut items: HashMap<u64, InventoryRecord> = HashMap::new();
        while let Some(stock) = stream.try_next().await? {
            items.insert(stock.product_id, InventoryRecord::from_stock(&stock));
        }

        self.cache.update_inventory_source(is_id, items).await
    }

    /// Rebuilds the four region projections for the changed products and
    /// prunes orphans against the SQL ground truth. Writes commit per chunk;
    /// readers may observe mixed-version state until the call returns.
    pub async fn refresh_region(&self, products_changed: &[u64], region_id: u64) -> Result<()> {
        let sources = self.repository.get_inventory_sources_store(region_id).await?;
        let no_pickup = self
            .repository
            .get_no_pickup_inventory_sources(region_id)
            .await?;
        let darkstores = self.repository.get_darkstore_ids(region_id).await?;

        if sources.is_empty() {
            return self.cache.truncate_region(region_id).await;
        }

        let source_ids: Vec<u64> = sources.keys().copied().collect();

        for chunk in products_changed.chunks(PRODUCT_CHUNK) {
            let mut list: HashMap<u64, Vec<InventoryRecordFull>> = HashMap::new();
            let mut store_sets: HashMap<u64, Vec<u64>> = HashMap::new();
            let mut best: HashMap<u64, InventoryRecordFull> = HashMap::new();

            let mut stream =
                self.repository
                    .stream_stocks(&source_ids, chunk, REGION_STREAM_CHUNK)?;

            while let Some(stock) = stream.try_next().await? {
                let pickup_source = !no_pickup.contains(&stock.inventory_source_id);

                let Some(bindings) = sources.get(&stock.inventory_source_id) else {
                    continue;
                };

                for binding in bindings {
                    list.entry(stock.product_id).or_default().push(
                        InventoryRecordFull::from_stock(
                            &stock,
                            binding.source_type,
                            binding.source_id,
                            binding.store_id,
                            false,
                        ),
                    );

                    if pickup_source && binding.source_type == SOURCE_TYPE_MAIN {
                        store_sets
                            .entry(stock.product_id)
                            .or_default()
                            .push(binding.store_id);
                    }

                    match best.entry(stock.product_id) {
                        Entry::Vacant(slot) => {
                            let source_type = if darkstores.contains(&binding.store_id) {
                                SOURCE_TYPE_DARKSTORE
                            } else {
                                binding.source_type
                            };

                            slot.insert(InventoryRecordFull::from_stock(
                                &stock,
                                source_type,
                                stock.inventory_source_id,
                                binding.store_id,
                                false,
                            ));
                        }
                        Entry::Occupied(mut slot) => {
                            let incumbent = slot.get_mut();

                            // A pickup-enabled Main source displaces a
                            // non-Main incumbent (darkstores included) or a
                            // smaller quantity.
                            if pickup_source
                                && binding.source_type == SOURCE_TYPE_MAIN
                                && (incumbent.source_type != SOURCE_TYPE_MAIN
                                    || stock.qty > incumbent.quantity)
                            {
                                incumbent.quantity = stock.qty;
                                incumbent.valid_date = stock.valid_date_str();
                                incumbent.store_id = binding.store_id;
                                incumbent.source_type = binding.source_type;
                                incumbent.source_id = stock.inventory_source_id;
                            }

                            if stock.price < incumbent.price {
                                incumbent.price = stock.price;
                                incumbent.varies = true;
                            }

                            if !incumbent.varies && stock.price != incumbent.price {
                                incumbent.varies = true;
                            }
                        }
                    }
                }
            }

            self.cache.update_region_list(region_id, list).await?;
            self.cache.update_region_stores(region_id, store_sets).await?;
            self.cache.update_region_max(region_id, best.clone()).await?;
            self.cache.update_region_last(region_id, best).await?;
        }

        self.prune_orphans(region_id, &source_ids).await
    }

    /// Removes product keys that no longer exist in any of the region's
    /// sources from the three listable projections.
    async fn prune_orphans(&self, region_id: u64, source_ids: &[u64]) -> Result<()> {
        let db_products: HashSet<u64> = self
            .repository
            .get_stocks_product_id(source_ids, &[])
            .await?
            .into_iter()
            .collect();

        let cached = self.cache.region_list_product_ids(region_id).await?;
        let orphans = missing_from(&cached, &db_products);
        self.cache.delete_region_list(region_id, &orphans).await?;

        let cached = self.cache.region_stores_product_ids(region_id).await?;
        let orphans = missing_from(&cached, &db_products);
        self.cache.delete_region_stores(region_id, &orphans).await?;

        let cached = self.cache.region_max_product_ids(region_id).await?;
        let orphans = missing_from(&cached, &db_products);
        self.cache.delete_region_max(region_id, &orphans).await?;

        Ok(())
    }
}

fn missing_from(cached: &[u64], db_products: &HashSet<u64>) -> Vec<u64> {
    cached
        .iter()
        .copied()
        .filter(|product_id| !db_products.contains(product_id))
        .collect()
}
