use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const MIN_RETRY_BASE_MS: u64 = 50;
const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_DB_PATH: &str = "data/sei.sqlite";

/// Runtime knobs, resolved once from the environment and passed explicitly
/// to the fetcher and batch driver.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard per-attempt timeout for portal fetches.
    pub fetch_timeout: Duration,
    /// Retry budget on top of the first attempt.
    pub fetch_retries: u32,
    /// Base delay for exponential backoff between attempts.
    pub fetch_retry_base: Duration,
    /// Worker count for ad-hoc multi-URL capture, clamped to 1..=5.
    pub import_concurrency: usize,
    /// SQLite database location.
    pub db_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            fetch_retries: DEFAULT_RETRIES,
            fetch_retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            import_concurrency: DEFAULT_CONCURRENCY,
            db_path: DEFAULT_DB_PATH.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let timeout_ms = env_u64("FETCH_TIMEOUT_MS").unwrap_or(DEFAULT_TIMEOUT_MS);
        let retries = env_u64("FETCH_RETRIES")
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_RETRIES);
        let base_ms = env_u64("FETCH_RETRY_BASE_MS")
            .unwrap_or(DEFAULT_RETRY_BASE_MS)
            .max(MIN_RETRY_BASE_MS);
        let concurrency = env_u64("IMPORT_CONCURRENCY")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(1, 5);
        let db_path = std::env::var("SEI_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        Self {
            fetch_timeout: Duration::from_millis(timeout_ms),
            fetch_retries: retries,
            fetch_retry_base: Duration::from_millis(base_ms),
            import_concurrency: concurrency,
            db_path,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
