//! HTTP client for the upstream e-commerce catalog.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::types::{ChangeDates, UpstreamStock, UPSTREAM_TIME_FORMAT};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget against the catalog.
const CATALOG_RATE_PER_SEC: u32 = 3;
const CATALOG_BURST: u32 = 4;

const CHANGE_DATES_TIMEOUT: Duration = Duration::from_secs(20);
const STOCKS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Change-date pairs per source from `stocks/stores/`. Rows that fail to
    /// parse are dropped; the rest of the response survives.
    async fn get_inventory_change_dates(&self) -> Result<HashMap<u64, ChangeDates>>;

    /// Stocks of one source, merged by product id. `date_from` selects a
    /// delta pull.
    async fn get_stocks(
        &self,
        is_id: u64,
        date_from: Option<NaiveDateTime>,
    ) -> Result<HashMap<u64, UpstreamStock>>;
}

pub struct CatalogHttpClient {
    http: reqwest::Client,
    config: CatalogConfig,
    limiter: DirectLimiter,
}

impl CatalogHttpClient {
    pub fn new(config: CatalogConfig) -> Result<Self> {
        let rate = NonZeroU32::new(CATALOG_RATE_PER_SEC).expect("nonzero rate");
        let burst = NonZeroU32::new(CATALOG_BURST).expect("nonzero burst");

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            config,
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.config.host, path))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
    }
}

#[derive(Deserialize)]
struct StoresResponse {
    #[serde(rename = "storesList", default)]
    stores_list: Vec<StoreRow>,
}

#[derive(Deserialize)]
struct StoreRow {
    #[serde(rename = "storeId", default)]
    store_id: String,
    #[serde(rename = "fullStocksDate", default)]
    full_stocks_date: String,
    #[serde(rename = "partStocksDate", default)]
    part_stocks_date: String,
}

#[derive(Deserialize)]
struct StocksResponse {
    #[serde(default)]
    stocks: Vec<UpstreamStock>,
}

/// Keeps the date component of an upstream timestamp; anything shorter than
/// 10 characters is cleared.
fn truncate_valid_date(raw: Option<String>) -> Option<String> {
    raw.and_then(|date| date.get(..10).map(str::to_string))
}

#[async_trait]
impl CatalogClient for CatalogHttpClient {
    async fn get_inventory_change_dates(&self) -> Result<HashMap<u64, ChangeDates>> {
        self.limiter.until_ready().await;

        let response = self
            .request("stocks/stores/")
            .timeout(CHANGE_DATES_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let parsed: StoresResponse = response.json().await?;

        let mut change_dates = HashMap::with_capacity(parsed.stores_list.len());
        for row in parsed.stores_list {
            let Ok(is_id) = row.store_id.parse::<u64>() else {
                debug!(store_id = %row.store_id, "dropping change-date row with bad store id");
                continue;
            };
            let Ok(full_stocks) =
                NaiveDateTime::parse_from_str(&row.full_stocks_date, UPSTREAM_TIME_FORMAT)
            else {
                continue;
            };
            let Ok(part_stocks) =
                NaiveDateTime::parse_from_str(&row.part_stocks_date, UPSTREAM_TIME_FORMAT)
            else {
                continue;
            };

            change_dates.insert(
                is_id,
                ChangeDates {
                    part_stocks,
                    full_stocks,
                },
            );
        }

        Ok(change_dates)
    }

    async fn get_stocks(
        &self,
        is_id: u64,
        date_from: Option<NaiveDateTime>,
    ) -> Result<HashMap<u64, UpstreamStock>> {
        let mut path = format!("stocks/{}?getSeparatedStocks=true", is_id);
        if let Some(from) = date_from {
            path.push_str("&dateFrom=");
            path.push_str(&from.format(UPSTREAM_TIME_FORMAT).to_string());
        }

        self.limiter.until_ready().await;

        let response = self
            .request(&path)
            .timeout(STOCKS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let parsed: StocksResponse = response.json().await?;

        let mut merged: HashMap<u64, UpstreamStock> = HashMap::with_capacity(parsed.stocks.len());
        for mut line in parsed.stocks {
            // Duplicate product lines sum their quantities; the later line's
            // price and valid date win.
            if let Some(previous) = merged.get(&line.product_id) {
                line.quantity += previous.quantity;
            }
            line.valid_date = truncate_valid_date(line.valid_date);

            merged.insert(line.product_id, line);
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CatalogHttpClient {
        CatalogHttpClient::new(CatalogConfig {
            host: format!("{}/", server.uri()),
            user: "importer".to_string(),
            password: "secret".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn change_dates_drop_unparseable_rows() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/stocks/stores/"))
            .and(header("Accept-Encoding", "identity"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "storesList": [
                    {
                        "storeId": "100",
                        "fullStocksDate": "2024-01-01T00:00:00",
                        "partStocksDate": "2024-01-02T00:00:00"
                    },
                    {
                        "storeId": "oops",
                        "fullStocksDate": "2024-01-01T00:00:00",
                        "partStocksDate": "2024-01-01T00:00:00"
                    },
                    {
                        "storeId": "200",
                        "fullStocksDate": "not a date",
                        "partStocksDate": "2024-01-01T00:00:00"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let dates = client_for(&server).get_inventory_change_dates().await.unwrap();

        assert_eq!(dates.len(), 1);
        let entry = &dates[&100];
        assert_eq!(
            entry.full_stocks,
            NaiveDateTime::parse_from_str("2024-01-01T00:00:00", UPSTREAM_TIME_FORMAT).unwrap()
        );
        assert_eq!(
            entry.part_stocks,
            NaiveDateTime::parse_from_str("2024-01-02T00:00:00", UPSTREAM_TIME_FORMAT).unwrap()
        );
    }

    #[tokio::test]
    async fn stocks_merge_duplicate_products() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/stocks/100"))
            .and(query_param("getSeparatedStocks", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stocks": [
                    {
                        "storeId": 100,
                        "goodsId": 7,
                        "quantity": 3.0,
                        "ecomPrice": 1.50,
                        "validDate": "2024-06-01T00:00:00"
                    },
                    {
                        "storeId": 100,
                        "goodsId": 7,
                        "quantity": 2.0,
                        "ecomPrice": 4.00,
                        "validDate": "2024-07-01T00:00:00"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let stocks = client_for(&server).get_stocks(100, None).await.unwrap();

        assert_eq!(stocks.len(), 1);
        let merged = &stocks[&7];
        assert_eq!(merged.quantity, 5);
        assert_eq!(merged.price_cents, 400);
        assert_eq!(merged.valid_date.as_deref(), Some("2024-07-01"));
    }

    #[tokio::test]
    async fn stocks_pass_date_from_and_clear_short_dates() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/stocks/100"))
            .and(query_param("getSeparatedStocks", "true"))
            .and(query_param("dateFrom", "2024-01-01T00:00:00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stocks": [
                    {
                        "storeId": 100,
                        "goodsId": 8,
                        "quantity": 2.0,
                        "ecomPrice": 4.00,
                        "validDate": "short"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let from =
            NaiveDateTime::parse_from_str("2024-01-01T00:00:00", UPSTREAM_TIME_FORMAT).unwrap();
        let stocks = client_for(&server).get_stocks(100, Some(from)).await.unwrap();

        assert_eq!(stocks[&8].valid_date, None);
    }
}
