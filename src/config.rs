use std::path::PathBuf;

use serde::Deserialize;

/// Which ledger backend the process runs against.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Which job queue the process hands work to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub pricing: PricingConfig,
    pub ledger: LedgerConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    pub queue_name: String,
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub max_upload_bytes: usize,
    pub max_proof_bytes: usize,
    pub proof_url_prefix: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    Fixed,
    Tiered,
}

/// Upper page bound (inclusive) and the token cost for documents up to it.
/// A tier without `max_pages` catches everything larger.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PriceTier {
    pub max_pages: Option<u32>,
    pub cost: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    pub mode: PricingMode,
    pub fixed_cost: i64,
    /// Cost charged in tiered mode when the page count is unknown.
    pub unknown_pages_cost: i64,
    #[serde(default = "default_price_tiers")]
    pub tiers: Vec<PriceTier>,
}

pub fn default_price_tiers() -> Vec<PriceTier> {
    vec![
        PriceTier { max_pages: Some(20), cost: 3 },
        PriceTier { max_pages: Some(50), cost: 5 },
        PriceTier { max_pages: Some(100), cost: 8 },
        PriceTier { max_pages: None, cost: 10 },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub stale_after_secs: i64,
    pub batch_size: i64,
}

impl Config {
    /// Layered load: built-in defaults, then `config/default.toml` (optional),
    /// then `APP__SECTION__KEY` environment variables. The conventional
    /// `DATABASE_URL`, `REDIS_URL` and `BIND_ADDRESS` variables win over all.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("server.bind_address", "0.0.0.0:8080")?
            .set_default("server.cors_origins", Vec::<String>::new())?
            .set_default("server.rate_limit_per_minute", 120)?
            .set_default("server.request_timeout_secs", 30)?
            .set_default("database.backend", "postgres")?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("queue.backend", "redis")?
            .set_default("queue.redis_url", "redis://127.0.0.1:6379")?
            .set_default("queue.queue_name", "smartcopy_jobs")?
            .set_default("queue.output_dir", "storage/outputs")?
            .set_default("storage.root", "storage")?
            .set_default("storage.max_upload_bytes", 50 * 1024 * 1024)?
            .set_default("storage.max_proof_bytes", 5 * 1024 * 1024)?
            .set_default("storage.proof_url_prefix", "/uploads/payment-proofs")?
            .set_default("pricing.mode", "fixed")?
            .set_default("pricing.fixed_cost", 1)?
            .set_default("pricing.unknown_pages_cost", 3)?
            .set_default("ledger.lock_timeout_ms", 5000)?
            .set_default("reconcile.enabled", true)?
            .set_default("reconcile.interval_secs", 60)?
            .set_default("reconcile.stale_after_secs", 300)?
            .set_default("reconcile.batch_size", 100)?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("queue.redis_url", std::env::var("REDIS_URL").ok())?
            .set_override_option("server.bind_address", std::env::var("BIND_ADDRESS").ok())?
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize() {
        let config = Config::load().expect("defaults should deserialize");

        assert_eq!(config.queue.queue_name, "smartcopy_jobs");
        assert_eq!(config.pricing.mode, PricingMode::Fixed);
        assert_eq!(config.pricing.fixed_cost, 1);
        assert_eq!(config.pricing.tiers, default_price_tiers());
        assert_eq!(config.storage.max_upload_bytes, 50 * 1024 * 1024);
        assert!(config.ledger.lock_timeout_ms > 0);
    }
}
