use std::env;

use granary_shared::{Error, Result};

/// Fixed service endpoints.
pub const LISTEN_PORT: u16 = 8000;

/// Logical Redis database holding the inventory projections.
const REDIS_DB: i64 = 4;

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub db_database: String,
    pub redis_host: String,
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("missing env {}", name)))
}

impl QueryConfig {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            db_host: required("DB_HOST")?,
            db_username: required("DB_USERNAME")?,
            db_password: required("DB_PASSWORD")?,
            db_database: required("DB_DATABASE")?,
            redis_host: required("REDIS_HOST")?,
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}/{}",
            self.db_username, self.db_password, self.db_host, self.db_database
        )
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}/{}", self.redis_host, REDIS_DB)
    }
}
