//! Short-TTL read-through memo for RPC responses.
//!
//! Entries hold either the response or the error that produced it; both
//! expire after the TTL. The whole store is swept by a background ticker.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::ApiError;
use crate::server::{
    InventoryResponse, RegionInventoryResponse, RegionMaxInventoryResponse, StoreCountResponse,
};

struct Entry<T> {
    result: Result<T, ApiError>,
    expires_at: Instant,
}

pub struct Memo<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: Clone> Memo<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn remember<F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > Instant::now() {
                    return entry.result.clone();
                }
            }
        }

        let result = load().await;

        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                result: result.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        result
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// One memo per operation; responses are typed, so the store is too.
pub struct MemoStore {
    pub inventory: Memo<InventoryResponse>,
    pub region: Memo<RegionInventoryResponse>,
    pub region_max: Memo<RegionMaxInventoryResponse>,
    pub region_last: Memo<RegionMaxInventoryResponse>,
    pub store_count: Memo<StoreCountResponse>,
}

impl MemoStore {
    pub fn new() -> Self {
        Self {
            inventory: Memo::new(),
            region: Memo::new(),
            region_max: Memo::new(),
            region_last: Memo::new(),
            store_count: Memo::new(),
        }
    }

    pub async fn clear_all(&self) {
        self.inventory.clear().await;
        self.region.clear().await;
        self.region_max.clear().await;
        self.region_last.clear().await;
        self.store_count.clear().await;
    }
}
