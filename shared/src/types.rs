//! Domain types shared by the importer and the query service.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer};

/// Source binding types as stored in `inventory_source_store_region.type`.
/// The set is open; only these two carry behavior.
pub const SOURCE_TYPE_MAIN: u64 = 0;
pub const SOURCE_TYPE_DARKSTORE: u64 = 3;

/// Timestamp format used by the upstream catalog (local time, no zone).
pub const UPSTREAM_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// An upstream stock location bound to exactly one region. `changed_at` is
/// the high-water mark already imported; `None` means never imported.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InventorySource {
    pub id: u64,
    pub region_id: u64,
    pub changed_at: Option<NaiveDateTime>,
}

/// An IS-store binding inside a region.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegionInventorySource {
    #[sqlx(rename = "inventory_source_id")]
    pub source_id: u64,
    pub store_id: u64,
    #[sqlx(rename = "type")]
    pub source_type: u64,
}

/// A reconciled stock row. `price` is in centimil units (price x 10 000);
/// the SQL read multiplies the stored decimal by 100.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Stock {
    pub id: String,
    pub product_id: u64,
    pub inventory_source_id: u64,
    pub qty: u64,
    pub price: u64,
    pub valid_date: Option<NaiveDate>,
}

impl Stock {
    /// Date component rendered for cache records, empty when absent.
    pub fn valid_date_str(&self) -> String {
        self.valid_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }
}

/// Change-date pair the upstream publishes per source so importers can pull
/// deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDates {
    pub part_stocks: NaiveDateTime,
    pub full_stocks: NaiveDateTime,
}

/// One merged upstream stock line. Prices are kept in cents (price x 100);
/// `valid_date` is already truncated to its date component.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamStock {
    #[serde(rename = "goodsId")]
    pub product_id: u64,
    #[serde(rename = "quantity", deserialize_with = "quantity_from_number")]
    pub quantity: u64,
    #[serde(rename = "ecomPrice", deserialize_with = "cents_from_number")]
    pub price_cents: u64,
    #[serde(rename = "validDate", default)]
    pub valid_date: Option<String>,
}

impl UpstreamStock {
    /// A line with no quantity or no price removes the product from its
    /// source rather than updating it.
    pub fn is_empty(&self) -> bool {
        self.quantity == 0 || self.price_cents == 0
    }
}

/// Quantities arrive as decimal numbers; only the integer part is kept.
fn quantity_from_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value <= 0.0 {
        return Ok(0);
    }
    Ok(value as u64)
}

/// Prices arrive as decimal numbers and are persisted as floor(value x 100).
fn cents_from_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value <= 0.0 {
        return Ok(0);
    }
    Ok((value * 100.0) as u64)
}

/// Decimal rendering of a cent amount for the SQL price column.
pub fn price_decimal(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

/// The SQL primary key is a pure function of the natural key, so identical
/// upserts collapse into one row.
pub fn stock_id(is_id: u64, product_id: u64, quantity: u64, price_cents: u64) -> String {
    format!("{}-{}-{}-{}", is_id, product_id, quantity, price_cents)
}

/// An active discount for a product. `discount_type` selects the formula,
/// `type_value` is its operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discount {
    pub discount_type: String,
    pub type_value: u64,
}

/// Active discounts keyed by region then product; region 0 is the wildcard
/// across all regions.
pub type RegionProductDiscounts = HashMap<u64, HashMap<u64, Discount>>;
