use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use granary_shared::cache::RedisInventoryCache;
use granary_shared::repository::MySqlInventoryRepository;

mod config;
mod discounts;
mod error;
mod memo;
mod server;

use config::{QueryConfig, LISTEN_PORT};
use discounts::DiscountService;
use memo::MemoStore;
use server::AppState;

/// The whole memo store is dropped on this period.
const MEMO_SWEEP_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);

/// Discounts are re-read from SQL on this period.
const DISCOUNT_REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "granary=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = QueryConfig::load()?;
    info!("configuration loaded");

    let repository = Arc::new(MySqlInventoryRepository::connect(&config.database_url()).await?);
    info!("database connected");

    let cache = Arc::new(RedisInventoryCache::connect(&config.redis_url()).await?);
    info!("cache connected");

    let discounts = Arc::new(DiscountService::new(repository));
    discounts.sync().await;

    let memo = Arc::new(MemoStore::new());

    {
        let discounts = Arc::clone(&discounts);
        let memo = Arc::clone(&memo);

        tokio::spawn(async move {
            let mut memo_sweep =
                interval_at(Instant::now() + MEMO_SWEEP_PERIOD, MEMO_SWEEP_PERIOD);
            let mut discount_refresh = interval_at(
                Instant::now() + DISCOUNT_REFRESH_PERIOD,
                DISCOUNT_REFRESH_PERIOD,
            );

            loop {
                tokio::select! {
                    _ = memo_sweep.tick() => {
                        debug!("sweeping memo caches");
                        memo.clear_all().await;
                    }
                    _ = discount_refresh.tick() => discounts.sync().await,
                }
            }
        });
    }

    let app = server::router(Arc::new(AppState {
        cache,
        discounts,
        memo,
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT));
    info!(%addr, "query service ready");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
