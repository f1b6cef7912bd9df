//! Redis adapter for the inventory projections.
//!
//! All writes go through pipelined transactions over hashes named by fixed
//! patterns. The adapter owns a semaphore bounding concurrent pipelines.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Semaphore;

use crate::codec::{
    count_store_set, decode_record_list, encode_record_list, encode_store_set, InventoryRecord,
    InventoryRecordFull,
};
use crate::error::{Error, Result};

/// Process-wide bound on concurrent cache pipelines.
const MAX_PIPELINES: usize = 10;

#[async_trait]
pub trait InventoryCache: Send + Sync {
    /// Atomically replaces the single-source hash `inventory:<isId>`.
    async fn update_inventory_source(
        &self,
        is_id: u64,
        items: HashMap<u64, InventoryRecord>,
    ) -> Result<()>;

    /// Drops the three region projections outright.
    async fn truncate_region(&self, region_id: u64) -> Result<()>;

    /// Merge-writes the per-source list projection.
    async fn update_region_list(
        &self,
        region_id: u64,
        items: HashMap<u64, Vec<InventoryRecordFull>>,
    ) -> Result<()>;

    /// Merge-writes the pickup store-set projection.
    async fn update_region_stores(
        &self,
        region_id: u64,
        items: HashMap<u64, Vec<u64>>,
    ) -> Result<()>;

    /// Merge-writes the best-variant projection.
    async fn update_region_max(
        &self,
        region_id: u64,
        items: HashMap<u64, InventoryRecordFull>,
    ) -> Result<()>;

    /// Merge-writes the last-seen projection.
    async fn update_region_last(
        &self,
        region_id: u64,
        items: HashMap<u64, InventoryRecordFull>,
    ) -> Result<()>;

    async fn region_list_product_ids(&self, region_id: u64) -> Result<Vec<u64>>;
    async fn region_stores_product_ids(&self, region_id: u64) -> Result<Vec<u64>>;
    async fn region_max_product_ids(&self, region_id: u64) -> Result<Vec<u64>>;

    async fn delete_region_list(&self, region_id: u64, product_ids: &[u64]) -> Result<()>;
    async fn delete_region_stores(&self, region_id: u64, product_ids: &[u64]) -> Result<()>;
    async fn delete_region_max(&self, region_id: u64, product_ids: &[u64]) -> Result<()>;

    async fn get_inventory(&self, is_id: u64, product_id: u64) -> Result<InventoryRecord>;
    async fn get_region_list(
        &self,
        region_id: u64,
        product_id: u64,
    ) -> Result<Vec<InventoryRecordFull>>;
    async fn get_region_store_count(&self, region_id: u64, product_id: u64) -> Result<u64>;
    async fn get_region_max(&self, region_id: u64, product_id: u64)
        -> Result<InventoryRecordFull>;
    async fn get_region_last(
        &self,
        region_id: u64,
        product_id: u64,
    ) -> Result<InventoryRecordFull>;
}

pub struct RedisInventoryCache {
    conn: ConnectionManager,
    pipelines: Semaphore,
}

impl RedisInventoryCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            pipelines: Semaphore::new(MAX_PIPELINES),
        })
    }

    fn inventory_key(is_id: u64) -> String {
        format!("inventory:{}", is_id)
    }

    fn region_list_key(region_id: u64) -> String {
        format!("inventory-region:{}", region_id)
    }

    fn region_stores_key(region_id: u64) -> String {
        format!("inventory-region-st:{}", region_id)
    }

    fn region_max_key(region_id: u64) -> String {
        format!("inventory-max:{}", region_id)
    }

    fn region_last_key(region_id: u64) -> String {
        format!("inventory-last:{}", region_id)
    }

    /// Writes a batch of hash fields in one pipelined transaction. With
    /// `truncate` the key is deleted first, making the write an atomic
    /// replacement; an empty value deletes the field.
    async fn write_hash(
        &self,
        key: &str,
        items: HashMap<u64, String>,
        truncate: bool,
    ) -> Result<()> {
        let _permit = self
            .pipelines
            .acquire()
            .await
            .map_err(|_| Error::Internal("cache pipeline limiter closed".to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        if truncate {
            pipe.del(key).ignore();
        }

        for (product_id, value) in &items {
            if value.is_empty() {
                pipe.hdel(key, product_id).ignore();
            } else {
                pipe.hset(key, product_id, value).ignore();
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn delete_fields(&self, key: &str, product_ids: &[u64]) -> Result<()> {
        if product_ids.is_empty() {
            return Ok(());
        }

        let _permit = self
            .pipelines
            .acquire()
            .await
            .map_err(|_| Error::Internal("cache pipeline limiter closed".to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        for product_id in product_ids {
            pipe.hdel(key, product_id).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn hash_product_ids(&self, key: &str) -> Result<Vec<u64>> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(key).await?;

        fields
            .into_iter()
            .map(|field| {
                field
                    .parse::<u64>()
                    .map_err(|_| Error::CorruptRecord(format!("{}: field {}", key, field)))
            })
            .collect()
    }

    async fn read_field(&self, key: &str, product_id: u64) -> Result<String> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, product_id).await?;

        value.ok_or_else(|| Error::NotFound(format!("{} / {}", key, product_id)))
    }
}

#[async_trait]
impl InventoryCache for RedisInventoryCache {
    async fn update_inventory_source(
        &self,
        is_id: u64,
        items: HashMap<u64, InventoryRecord>,
    ) -> Result<()> {
        let prepared = items
            .into_iter()
            .map(|(product_id, record)| (product_id, record.encode()))
            .collect();

        self.write_hash(&Self::inventory_key(is_id), prepared, true)
            .await
    }

    async fn truncate_region(&self, region_id: u64) -> Result<()> {
        let _permit = self
            .pipelines
            .acquire()
            .await
            .map_err(|_| Error::Internal("cache pipeline limiter closed".to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(Self::region_list_key(region_id)).ignore();
        pipe.del(Self::region_stores_key(region_id)).ignore();
        pipe.del(Self::region_max_key(region_id)).ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn update_region_list(
        &self,
        region_id: u64,
        items: HashMap<u64, Vec<InventoryRecordFull>>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let prepared = items
            .into_iter()
            .map(|(product_id, records)| (product_id, encode_record_list(&records)))
            .collect();

        self.write_hash(&Self::region_list_key(region_id), prepared, false)
            .await
    }

    async fn update_region_stores(
        &self,
        region_id: u64,
        items: HashMap<u64, Vec<u64>>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let prepared = items
            .into_iter()
            .map(|(product_id, store_ids)| (product_id, encode_store_set(&store_ids)))
            .collect();

        self.write_hash(&Self::region_stores_key(region_id), prepared, false)
            .await
    }

    async fn update_region_max(
        &self,
        region_id: u64,
        items: HashMap<u64, InventoryRecordFull>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let prepared = items
            .into_iter()
            .map(|(product_id, record)| (product_id, record.encode()))
            .collect();

        self.write_hash(&Self::region_max_key(region_id), prepared, false)
            .await
    }

    async fn update_region_last(
        &self,
        region_id: u64,
        items: HashMap<u64, InventoryRecordFull>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let prepared = items
            .into_iter()
            .map(|(product_id, record)| (product_id, record.encode()))
            .collect();

        self.write_hash(&Self::region_last_key(region_id), prepared, false)
            .await
    }

    async fn region_list_product_ids(&self, region_id: u64) -> Result<Vec<u64>> {
        self.hash_product_ids(&Self::region_list_key(region_id)).await
    }

    async fn region_stores_product_ids(&self, region_id: u64) -> Result<Vec<u64>> {
        self.hash_product_ids(&Self::region_stores_key(region_id))
            .await
    }

    async fn region_max_product_ids(&self, region_id: u64) -> Result<Vec<u64>> {
        self.hash_product_ids(&Self::region_max_key(region_id)).await
    }

    async fn delete_region_list(&self, region_id: u64, product_ids: &[u64]) -> Result<()> {
        self.delete_fields(&Self::region_list_key(region_id), product_ids)
            .await
    }

    async fn delete_region_stores(&self, region_id: u64, product_ids: &[u64]) -> Result<()> {
        self.delete_fields(&Self::region_stores_key(region_id), product_ids)
            .await
    }

    async fn delete_region_max(&self, region_id: u64, product_ids: &[u64]) -> Result<()> {
        self.delete_fields(&Self::region_max_key(region_id), product_ids)
            .await
    }

    async fn get_inventory(&self, is_id: u64, product_id: u64) -> Result<InventoryRecord> {
        let raw = self.read_field(&Self::inventory_key(is_id), product_id).await?;
        InventoryRecord::decode(&raw)
    }

    async fn get_region_list(
        &self,
        region_id: u64,
        product_id: u64,
    ) -> Result<Vec<InventoryRecordFull>> {
        let raw = self
            .read_field(&Self::region_list_key(region_id), product_id)
            .await?;
        decode_record_list(&raw)
    }

    async fn get_region_store_count(&self, region_id: u64, product_id: u64) -> Result<u64> {
        let raw = self
            .read_field(&Self::region_stores_key(region_id), product_id)
            .await?;
        Ok(count_store_set(&raw))
    }

    async fn get_region_max(
        &self,
        region_id: u64,
        product_id: u64,
    ) -> Result<InventoryRecordFull> {
        let raw = self
            .read_field(&Self::region_max_key(region_id), product_id)
            .await?;
        InventoryRecordFull::decode(&raw)
    }

    async fn get_region_last(
        &self,
        region_id: u64,
        product_id: u64,
    ) -> Result<InventoryRecordFull> {
        let raw = self
            .read_field(&Self::region_last_key(region_id), product_id)
            .await?;
        InventoryRecordFull::decode(&raw)
    }
}
