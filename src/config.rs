use std::env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            storage: StorageConfig::load(),
        }
    }
}

// --- STORAGE ---

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: String,
    pub connect_attempts: u32,
    pub connect_retry_ms: u64,
    // Row TTL
    pub use_row_ttl: bool,
    pub row_ttl_ms: u64,
    // Buckets
    pub max_bucket_size: u64,
    pub max_bucket_records: u64,
    pub bucket_keep_alive_secs: u64,
    pub check_full_buckets_interval_ms: u64,
    pub store_buckets_interval_ms: u64,
    // Batches
    pub max_batch_size: u64,
    pub max_batch_records: u64,
    pub batch_close_timeout_ms: u64,
    pub batch_max_retries: u32,
    pub batch_channel_capacity: usize,
    // Write path
    pub retries_interval_ms: u64,
    // Read path
    pub max_resend_last: u64,
    pub log_level: String,
}

impl StorageConfig {
    pub fn load() -> Self {
        Self {
            db_path:                        get_env("BROOK_DB_PATH", "./data/brook.db"),
            connect_attempts:               get_env("BROOK_CONNECT_ATTEMPTS", "10"),
            connect_retry_ms:               get_env("BROOK_CONNECT_RETRY_MS", "2000"),
            use_row_ttl:                    get_env("BROOK_USE_ROW_TTL", "false"),
            row_ttl_ms:                     get_env("BROOK_ROW_TTL_MS", "259200000"),      // 3 days
            max_bucket_size:                get_env("BROOK_MAX_BUCKET_SIZE", "104857600"), // 100 MB
            max_bucket_records:             get_env("BROOK_MAX_BUCKET_RECORDS", "500000"),
            bucket_keep_alive_secs:         get_env("BROOK_BUCKET_KEEP_ALIVE_SECS", "60"),
            check_full_buckets_interval_ms: get_env("BROOK_CHECK_FULL_BUCKETS_MS", "1000"),
            store_buckets_interval_ms:      get_env("BROOK_STORE_BUCKETS_MS", "500"),
            max_batch_size:                 get_env("BROOK_MAX_BATCH_SIZE", "2400000"),    // 8000 records x ~300 bytes
            max_batch_records:              get_env("BROOK_MAX_BATCH_RECORDS", "8000"),
            batch_close_timeout_ms:         get_env("BROOK_BATCH_CLOSE_TIMEOUT_MS", "1000"),
            batch_max_retries:              get_env("BROOK_BATCH_MAX_RETRIES", "1000"),
            batch_channel_capacity:         get_env("BROOK_BATCH_CHAN_CAP", "10000"),
            retries_interval_ms:            get_env("BROOK_STORE_RETRY_MS", "500"),
            max_resend_last:                get_env("BROOK_MAX_RESEND_LAST", "10000"),
            log_level:                      get_env("BROOK_LOG", "error"),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
