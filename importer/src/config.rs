use std::env;
use std::time::Duration;

use granary_shared::upstream::CatalogConfig;
use granary_shared::{Error, Result};

/// Importer configuration. Every variable is required; a missing or invalid
/// one is a fatal startup error.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub db_database: String,
    pub redis_host: String,
    pub redis_db: i64,
    pub catalog: CatalogConfig,
    pub shop_flush_url: String,
    pub import_interval: Duration,
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("missing env {}", name)))
}

impl ImporterConfig {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let redis_db = required("INVENTORY_DB")?
            .parse::<i64>()
            .map_err(|_| Error::Config("INVENTORY_DB is not an integer".to_string()))?;

        let interval_minutes = required("IMPORT_INTERVAL_MINUTES")?
            .parse::<u64>()
            .map_err(|_| Error::Config("IMPORT_INTERVAL_MINUTES is not an integer".to_string()))?;

        Ok(Self {
            db_host: required("DB_HOST")?,
            db_username: required("DB_USERNAME")?,
            db_password: required("DB_PASSWORD")?,
            db_database: required("DB_DATABASE")?,
            redis_host: required("REDIS_HOST")?,
            redis_db,
            catalog: CatalogConfig {
                host: required("ECOM_HOST")?,
                user: required("ECOM_USER")?,
                password: required("ECOM_PASSWORD")?,
            },
            shop_flush_url: required("SHOP_FLUSHURL")?,
            import_interval: Duration::from_secs(interval_minutes * 60),
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}/{}",
            self.db_username, self.db_password, self.db_host, self.db_database
        )
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}/{}", self.redis_host, self.redis_db)
    }
}
