use std::sync::Arc;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use granary_shared::cache::RedisInventoryCache;
use granary_shared::repository::MySqlInventoryRepository;
use granary_shared::upstream::CatalogHttpClient;

mod config;
mod refresh;
mod report;
mod service;

#[cfg(test)]
mod tests;

use config::ImporterConfig;
use service::ImportService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "granary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ImporterConfig::load()?;
    info!("configuration loaded");

    let repository = Arc::new(MySqlInventoryRepository::connect(&config.database_url()).await?);
    info!("database connected");

    let cache = Arc::new(RedisInventoryCache::connect(&config.redis_url()).await?);
    info!("cache connected");

    let catalog = Arc::new(CatalogHttpClient::new(config.catalog.clone())?);

    loop {
        info!("import cycle starting");

        let service = Arc::new(ImportService::new(
            repository.clone(),
            catalog.clone(),
            cache.clone(),
            config.shop_flush_url.clone(),
        ));

        let report = service.run_cycle().await;
        report.log();

        tokio::time::sleep(config.import_interval).await;
    }
}
