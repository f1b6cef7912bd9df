//! MySQL repository for regions, sources, stocks and discounts.
//!
//! SQL composition rule: integer arguments are explicitly formatted and
//! concatenated into the statement text; string arguments are always bound
//! parametrically. `IN`/`NOT IN` lists only ever contain formatted integers.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crate::error::{Error, Result};
use crate::types::{
    price_decimal, stock_id, Discount, InventorySource, RegionInventorySource,
    RegionProductDiscounts, Stock, UpstreamStock,
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket across the whole repository.
const SQL_RATE_PER_SEC: u32 = 20;

/// Per-call deadlines.
const CALL_DEADLINE: Duration = Duration::from_secs(180);
const DISCOUNTS_DEADLINE: Duration = Duration::from_secs(20);

/// Batch sizes for bulk statements.
const UPSERT_CHUNK: usize = 1000;
const STOCKS_CHANGED_CHUNK: usize = 5000;

/// A lazily paged stream of stock rows; errors surface in-band.
pub type StockStream = BoxStream<'static, Result<Stock>>;

#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// Active region ids.
    async fn get_regions(&self) -> Result<Vec<u64>>;

    /// Active sources of a region.
    async fn get_inventory_sources(&self, region_id: u64) -> Result<Vec<InventorySource>>;

    /// Sources whose stores are all non-pickup.
    async fn get_no_pickup_inventory_sources(&self, region_id: u64) -> Result<HashSet<u64>>;

    /// Stores marked default in the region.
    async fn get_darkstore_ids(&self, region_id: u64) -> Result<HashSet<u64>>;

    /// Source-store bindings of the region, grouped by source.
    async fn get_inventory_sources_store(
        &self,
        region_id: u64,
    ) -> Result<HashMap<u64, Vec<RegionInventorySource>>>;

    /// Advances (or resets, with `None`) the import high-water mark.
    async fn update_is_changed_at(
        &self,
        is_id: u64,
        changed_at: Option<NaiveDateTime>,
    ) -> Result<()>;

    /// Deletes all stocks of a source and clears its high-water mark in one
    /// atomic unit.
    async fn truncate_stocks(&self, is_id: u64) -> Result<()>;

    async fn delete_stocks(&self, is_id: u64, product_ids: &[u64]) -> Result<()>;

    async fn upsert_stocks(&self, is_id: u64, stocks: &HashMap<u64, UpstreamStock>)
        -> Result<()>;

    /// Marks products dirty for downstream services.
    async fn update_product_stocks_changed(&self, product_ids: &[u64]) -> Result<()>;

    /// Distinct product ids currently present in the given sources.
    async fn get_stocks_product_id(
        &self,
        is_ids: &[u64],
        skip_product_ids: &[u64],
    ) -> Result<Vec<u64>>;

    /// Lazily pages stock rows matching the given sources/products.
    fn stream_stocks(
        &self,
        is_ids: &[u64],
        product_ids: &[u64],
        chunk_size: u64,
    ) -> Result<StockStream>;

    /// Discounts active today, `{regionId -> {productId -> Discount}}`.
    async fn get_discounts(&self) -> Result<RegionProductDiscounts>;
}

pub struct MySqlInventoryRepository {
    pool: MySqlPool,
    limiter: Arc<DirectLimiter>,
}

impl MySqlInventoryRepository {
    pub fn new(pool: MySqlPool) -> Self {
        let rate = NonZeroU32::new(SQL_RATE_PER_SEC).expect("nonzero rate");
        let burst = NonZeroU32::new(SQL_RATE_PER_SEC + 1).expect("nonzero burst");
        Self::with_quota(pool, Quota::per_second(rate).allow_burst(burst))
    }

    /// Limiter injection point for faster-ticking tests.
    pub fn with_quota(pool: MySqlPool, quota: Quota) -> Self {
        Self {
            pool,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(100)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }
}

async fn with_deadline<T, F>(deadline: Duration, query: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, query).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout),
    }
}

/// Appends ` field IN(1,2,3)` (or `NOT IN`) from formatted integers.
fn push_in_list(sql: &mut String, field: &str, ids: &[u64], not_in: bool) {
    sql.push(' ');
    sql.push_str(field);
    sql.push_str(if not_in { " NOT IN(" } else { " IN(" });

    for (index, id) in ids.iter().enumerate() {
        if index != 0 {
            sql.push(',');
        }
        let _ = write!(sql, "{}", id);
    }

    sql.push(')');
}

/// WHERE clause shared by the stock pager; at least one filter is required.
fn stock_condition(is_ids: &[u64], product_ids: &[u64]) -> Result<String> {
    let mut condition = String::new();

    if !is_ids.is_empty() {
        if is_ids.len() == 1 {
            let _ = write!(condition, " inventory_source_id={}", is_ids[0]);
        } else {
            push_in_list(&mut condition, "inventory_source_id", is_ids, false);
        }
    }

    if !product_ids.is_empty() {
        if !condition.is_empty() {
            condition.push_str(" AND");
        }
        push_in_list(&mut condition, "product_id", product_ids, false);
    }

    if condition.is_empty() {
        return Err(Error::InvalidInput(
            "stock query needs a source or product filter".to_string(),
        ));
    }

    Ok(condition)
}

#[async_trait]
impl InventoryRepository for MySqlInventoryRepository {
    async fn get_regions(&self) -> Result<Vec<u64>> {
        self.limiter.until_ready().await;

        let regions = with_deadline(
            CALL_DEADLINE,
            sqlx::query_scalar::<_, u64>("SELECT id FROM regions WHERE status=1")
                .fetch_all(&self.pool),
        )
        .await?;

        Ok(regions)
    }

    async fn get_inventory_sources(&self, region_id: u64) -> Result<Vec<InventorySource>> {
        self.limiter.until_ready().await;

        let sql = format!(
            "SELECT id, region_id, changed_at FROM inventory_sources \
             WHERE status=1 AND region_id={}",
            region_id
        );

        let sources = with_deadline(
            CALL_DEADLINE,
            sqlx::query_as::<_, InventorySource>(&sql).fetch_all(&self.pool),
        )
        .await?;

        Ok(sources)
    }

    async fn get_no_pickup_inventory_sources(&self, region_id: u64) -> Result<HashSet<u64>> {
        self.limiter.until_ready().await;

        let sql = format!(
            "SELECT inventory_source_id FROM stores \
             INNER JOIN store_inventory_source ON store_id=stores.id \
             WHERE pickup_point=0 AND status=1 AND region_id={}",
            region_id
        );

        let ids = with_deadline(
            CALL_DEADLINE,
            sqlx::query_scalar::<_, u64>(&sql).fetch_all(&self.pool),
        )
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn get_darkstore_ids(&self, region_id: u64) -> Result<HashSet<u64>> {
        self.limiter.until_ready().await;

        let sql = format!(
            "SELECT id FROM stores WHERE is_default=1 AND status=1 AND region_id={}",
            region_id
        );

        let ids = with_deadline(
            CALL_DEADLINE,
            sqlx::query_scalar::<_, u64>(&sql).fetch_all(&self.pool),
        )
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn get_inventory_sources_store(
        &self,
        region_id: u64,
    ) -> Result<HashMap<u64, Vec<RegionInventorySource>>> {
        self.limiter.until_ready().await;

        let sql = format!(
            "SELECT inventory_source_id, store_id, type FROM inventory_source_store_region \
             WHERE status=1 AND region_id={}",
            region_id
        );

        let bindings = with_deadline(
            CALL_DEADLINE,
            sqlx::query_as::<_, RegionInventorySource>(&sql).fetch_all(&self.pool),
        )
        .await?;

        let mut grouped: HashMap<u64, Vec<RegionInventorySource>> = HashMap::new();
        for binding in bindings {
            grouped.entry(binding.source_id).or_default().push(binding);
        }

        Ok(grouped)
    }

    async fn update_is_changed_at(
        &self,
        is_id: u64,
        changed_at: Option<NaiveDateTime>,
    ) -> Result<()> {
        self.limiter.until_ready().await;

        let sql = format!(
            "UPDATE inventory_sources SET changed_at=? WHERE id={}",
            is_id
        );

        with_deadline(
            CALL_DEADLINE,
            sqlx::query(&sql).bind(changed_at).execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn truncate_stocks(&self, is_id: u64) -> Result<()> {
        self.limiter.until_ready().await;

        let reset_sql = format!(
            "UPDATE inventory_sources SET changed_at=NULL WHERE id={}",
            is_id
        );
        let delete_sql = format!(
            "DELETE FROM product_inventories WHERE inventory_source_id={}",
            is_id
        );

        let pool = self.pool.clone();
        with_deadline(CALL_DEADLINE, async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&reset_sql).execute(&mut *tx).await?;
            sqlx::query(&delete_sql).execute(&mut *tx).await?;
            tx.commit().await
        })
        .await?;

        Ok(())
    }

    async fn delete_stocks(&self, is_id: u64, product_ids: &[u64]) -> Result<()> {
        if product_ids.is_empty() {
            return Ok(());
        }

        self.limiter.until_ready().await;

        let mut sql = format!(
            "DELETE FROM product_inventories WHERE inventory_source_id={} AND",
            is_id
        );
        push_in_list(&mut sql, "product_id", product_ids, false);

        with_deadline(CALL_DEADLINE, sqlx::query(&sql).execute(&self.pool)).await?;

        Ok(())
    }

    async fn upsert_stocks(
        &self,
        is_id: u64,
        stocks: &HashMap<u64, UpstreamStock>,
    ) -> Result<()> {
        let entries: Vec<(&u64, &UpstreamStock)> = stocks.iter().collect();

        for chunk in entries.chunks(UPSERT_CHUNK) {
            self.limiter.until_ready().await;

            let mut builder = QueryBuilder::<MySql>::new(
                "INSERT INTO product_inventories(id, product_id, inventory_source_id, price, qty, valid_date) VALUES ",
            );

            builder.push_values(chunk, |mut row, (product_id, stock)| {
                row.push_bind(stock_id(is_id, **product_id, stock.quantity, stock.price_cents));
                row.push(product_id.to_string());
                row.push(is_id.to_string());
                row.push(price_decimal(stock.price_cents));
                row.push(stock.quantity.to_string());
                row.push_bind(stock.valid_date.clone());
            });

            builder.push(
                " ON DUPLICATE KEY UPDATE id=VALUES(id), price=VALUES(price), \
                 qty=VALUES(qty), valid_date=VALUES(valid_date)",
            );

            with_deadline(CALL_DEADLINE, builder.build().execute(&self.pool)).await?;
        }

        Ok(())
    }

    async fn update_product_stocks_changed(&self, product_ids: &[u64]) -> Result<()> {
        if product_ids.is_empty() {
            return Ok(());
        }

        for chunk in product_ids.chunks(STOCKS_CHANGED_CHUNK) {
            self.limiter.until_ready().await;

            let mut sql = String::from("UPDATE products SET stocks_changed=1 WHERE");
            push_in_list(&mut sql, "id", chunk, false);

            with_deadline(CALL_DEADLINE, sqlx::query(&sql).execute(&self.pool)).await?;
        }

        Ok(())
    }

    async fn get_stocks_product_id(
        &self,
        is_ids: &[u64],
        skip_product_ids: &[u64],
    ) -> Result<Vec<u64>> {
        let mut sql = String::from("SELECT DISTINCT product_id FROM product_inventories");
        let mut condition = String::new();

        if !is_ids.is_empty() {
            if is_ids.len() == 1 {
                let _ = write!(condition, " inventory_source_id={}", is_ids[0]);
            } else {
                push_in_list(&mut condition, "inventory_source_id", is_ids, false);
            }
        }

        if !skip_product_ids.is_empty() {
            if !condition.is_empty() {
                condition.push_str(" AND");
            }
            push_in_list(&mut condition, "product_id", skip_product_ids, true);
        }

        if !condition.is_empty() {
            sql.push_str(" WHERE");
            sql.push_str(&condition);
        }

        self.limiter.until_ready().await;

        let ids = with_deadline(
            CALL_DEADLINE,
            sqlx::query_scalar::<_, u64>(&sql).fetch_all(&self.pool),
        )
        .await?;

        Ok(ids)
    }

    fn stream_stocks(
        &self,
        is_ids: &[u64],
        product_ids: &[u64],
        chunk_size: u64,
    ) -> Result<StockStream> {
        let condition = stock_condition(is_ids, product_ids)?;
        let pool = self.pool.clone();
        let limiter = Arc::clone(&self.limiter);

        let stream = try_stream! {
            let mut offset: u64 = 0;

            loop {
                let mut sql = format!(
                    "SELECT id, inventory_source_id, product_id, qty, \
                     CAST(price * 100 AS UNSIGNED) AS price, valid_date \
                     FROM product_inventories WHERE{} LIMIT {}",
                    condition, chunk_size
                );
                if offset > 0 {
                    let _ = write!(sql, " OFFSET {}", offset);
                }

                limiter.until_ready().await;

                let rows = with_deadline(
                    CALL_DEADLINE,
                    sqlx::query_as::<_, Stock>(&sql).fetch_all(&pool),
                )
                .await?;

                let fetched = rows.len() as u64;
                for row in rows {
                    yield row;
                }

                if fetched < chunk_size {
                    break;
                }
                offset += fetched;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn get_discounts(&self) -> Result<RegionProductDiscounts> {
        self.limiter.until_ready().await;

        let rows = with_deadline(
            DISCOUNTS_DEADLINE,
            sqlx::query(
                "SELECT region_id, discountable_id, type, type_value \
                 FROM discount_discountable \
                 LEFT JOIN discounts ON discounts.id = discount_discountable.discount_id \
                 LEFT JOIN discount_region ON discount_region.discount_id = discount_discountable.discount_id \
                 WHERE status=1 \
                 AND (date_from IS NULL OR DATE(date_from) <= CURDATE()) \
                 AND (date_to IS NULL OR DATE(date_to) >= CURDATE()) \
                 ORDER BY sort DESC",
            )
            .fetch_all(&self.pool),
        )
        .await?;

        let mut discounts: RegionProductDiscounts = HashMap::new();

        for row in rows {
            let region_id: Option<u64> = row.try_get("region_id")?;
            let product_id: u64 = row.try_get("discountable_id")?;
            let discount_type: String = row.try_get("type")?;
            let type_value: u64 = row.try_get("type_value")?;

            discounts.entry(region_id.unwrap_or(0)).or_default().insert(
                product_id,
                Discount {
                    discount_type,
                    type_value,
                },
            );
        }

        Ok(discounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_list_formats_integers() {
        let mut sql = String::new();
        push_in_list(&mut sql, "product_id", &[1, 22, 333], false);
        assert_eq!(sql, " product_id IN(1,22,333)");

        let mut sql = String::new();
        push_in_list(&mut sql, "product_id", &[7], true);
        assert_eq!(sql, " product_id NOT IN(7)");
    }

    #[test]
    fn stock_condition_single_source_uses_equality() {
        let condition = stock_condition(&[100], &[]).unwrap();
        assert_eq!(condition, " inventory_source_id=100");
    }

    #[test]
    fn stock_condition_combines_filters() {
        let condition = stock_condition(&[100, 200], &[7, 8]).unwrap();
        assert_eq!(
            condition,
            " inventory_source_id IN(100,200) AND product_id IN(7,8)"
        );
    }

    #[test]
    fn stock_condition_requires_a_filter() {
        assert!(stock_condition(&[], &[]).is_err());
    }
}
