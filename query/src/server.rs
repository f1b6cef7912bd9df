//! RPC surface over the inventory projections.
//!
//! Every operation consumes the same request envelope and returns prices
//! computed through the discount service. Responses memoize for 60 seconds
//! unless the requested quantity is above one, in which case totals depend
//! on the quantity and the memo is bypassed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use granary_shared::cache::InventoryCache;
use granary_shared::codec::InventoryRecordFull;

use crate::discounts::{DiscountService, PriceBreakdown};
use crate::error::ApiError;
use crate::memo::MemoStore;

const MEMO_TTL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub cache: Arc<dyn InventoryCache>,
    pub discounts: Arc<DiscountService>,
    pub memo: Arc<MemoStore>,
}

/// Shared request envelope. `isId` is only meaningful for `GetInventory`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    #[serde(default)]
    pub region_id: u64,
    #[serde(default)]
    pub product_id: u64,
    #[serde(default)]
    pub quantity: u64,
    #[serde(default)]
    pub is_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInventory {
    pub quantity: u64,
    pub price: u64,
    pub discount_price: u64,
    pub sum: u64,
    pub discount_sum: u64,
    pub valid_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInventoryFull {
    pub quantity: u64,
    pub price: u64,
    pub discount_price: u64,
    pub sum: u64,
    pub discount_sum: u64,
    pub valid_date: String,
    pub is_id: u64,
    pub store_id: u64,
    pub is_type: u64,
    pub is_varies: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryResponse {
    pub item: ProductInventory,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionInventoryResponse {
    pub items: Vec<ProductInventoryFull>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionMaxInventoryResponse {
    pub item: ProductInventoryFull,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreCountResponse {
    pub cnt: u64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/inventory", post(get_inventory))
        .route("/v1/region-inventory", post(get_region_inventory))
        .route("/v1/region-max-inventory", post(get_region_max_inventory))
        .route("/v1/region-last-inventory", post(get_region_last_inventory))
        .route("/v1/region-store-has", post(get_region_store_has))
        .route("/v1/region-store-has-cnt", post(get_region_store_has_cnt))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn validate(request: &RpcRequest) -> Result<(), ApiError> {
    if request.region_id == 0 {
        return Err(ApiError::invalid("no region id"));
    }
    if request.product_id == 0 {
        return Err(ApiError::invalid("no product id"));
    }
    Ok(())
}

fn full_item(record: InventoryRecordFull, prices: PriceBreakdown) -> ProductInventoryFull {
    ProductInventoryFull {
        quantity: record.quantity,
        price: prices.price,
        discount_price: prices.discount_price,
        sum: prices.sum,
        discount_sum: prices.discount_sum,
        valid_date: record.valid_date,
        is_id: record.source_id,
        store_id: record.store_id,
        is_type: record.source_type,
        is_varies: record.varies,
    }
}

async fn get_inventory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<InventoryResponse>, ApiError> {
    if request.is_id == 0 {
        return Err(ApiError::invalid("no is id"));
    }
    if request.product_id == 0 {
        return Err(ApiError::invalid("no product id"));
    }

    let key = format!(
        "inv:{}:{}:{}",
        request.region_id, request.is_id, request.product_id
    );

    let loader_state = Arc::clone(&state);
    let load = move || async move {
        let record = loader_state
            .cache
            .get_inventory(request.is_id, request.product_id)
            .await
            .map_err(ApiError::not_found)?;

        let prices = loader_state
            .discounts
            .calc(
                request.region_id,
                request.product_id,
                request.quantity,
                record.price,
            )
            .await?;

        Ok(InventoryResponse {
            item: ProductInventory {
                quantity: record.quantity,
                price: prices.price,
                discount_price: prices.discount_price,
                sum: prices.sum,
                discount_sum: prices.discount_sum,
                valid_date: record.valid_date,
            },
        })
    };

    let response = if request.quantity > 1 {
        load().await?
    } else {
        state.memo.inventory.remember(&key, MEMO_TTL, load).await?
    };

    Ok(Json(response))
}

async fn get_region_inventory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RegionInventoryResponse>, ApiError> {
    validate(&request)?;

    let key = format!("ri:{}:{}", request.region_id, request.product_id);

    let loader_state = Arc::clone(&state);
    let load = move || async move {
        let records = loader_state
            .cache
            .get_region_list(request.region_id, request.product_id)
            .await
            .map_err(ApiError::not_found)?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let prices = loader_state
                .discounts
                .calc(
                    request.region_id,
                    request.product_id,
                    request.quantity,
                    record.price,
                )
                .await?;
            items.push(full_item(record, prices));
        }

        Ok(RegionInventoryResponse { items })
    };

    let response = if request.quantity > 1 {
        load().await?
    } else {
        state.memo.region.remember(&key, MEMO_TTL, load).await?
    };

    Ok(Json(response))
}

async fn get_region_max_inventory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RegionMaxInventoryResponse>, ApiError> {
    validate(&request)?;

    let key = format!("rmi:{}:{}", request.region_id, request.product_id);

    let loader_state = Arc::clone(&state);
    let load = move || async move {
        let record = loader_state
            .cache
            .get_region_max(request.region_id, request.product_id)
            .await
            .map_err(ApiError::not_found)?;

        let prices = loader_state
            .discounts
            .calc(
                request.region_id,
                request.product_id,
                request.quantity,
                record.price,
            )
            .await?;

        Ok(RegionMaxInventoryResponse {
            item: full_item(record, prices),
        })
    };

    let response = if request.quantity > 1 {
        load().await?
    } else {
        state.memo.region_max.remember(&key, MEMO_TTL, load).await?
    };

    Ok(Json(response))
}

async fn get_region_last_inventory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RegionMaxInventoryResponse>, ApiError> {
    validate(&request)?;

    let key = format!("rli:{}:{}", request.region_id, request.product_id);

    let loader_state = Arc::clone(&state);
    let load = move || async move {
        let record = loader_state
            .cache
            .get_region_last(request.region_id, request.product_id)
            .await
            .map_err(ApiError::not_found)?;

        let prices = loader_state
            .discounts
            .calc(
                request.region_id,
                request.product_id,
                request.quantity,
                record.price,
            )
            .await?;

        Ok(RegionMaxInventoryResponse {
            item: full_item(record, prices),
        })
    };

    let response = if request.quantity > 1 {
        load().await?
    } else {
        state.memo.region_last.remember(&key, MEMO_TTL, load).await?
    };

    Ok(Json(response))
}

async fn get_region_store_has(
    State(_state): State<Arc<AppState>>,
    Json(_request): Json<RpcRequest>,
) -> Result<Json<StoreCountResponse>, ApiError> {
    Err(ApiError::unimplemented())
}

/// Store counts do not depend on the quantity, so the memo always applies.
async fn get_region_store_has_cnt(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<StoreCountResponse>, ApiError> {
    validate(&request)?;

    let key = format!("rshc:{}:{}", request.region_id, request.product_id);

    let loader_state = Arc::clone(&state);
    let response = state
        .memo
        .store_count
        .remember(&key, MEMO_TTL, move || async move {
            let cnt = loader_state
                .cache
                .get_region_store_count(request.region_id, request.product_id)
                .await
                .map_err(ApiError::not_found)?;

            Ok(StoreCountResponse { cnt })
        })
        .await?;

    Ok(Json(response))
}
