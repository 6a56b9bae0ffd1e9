//! Environment-driven configuration.

use std::time::Duration;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (`LUMAGEN_BIND`).
    pub bind_addr: String,
    /// HS256 secret for API bearer tokens (`JWT_SECRET`).
    pub jwt_secret: String,
    /// Shared secret expected on inbound provider callbacks
    /// (`PROVIDER_CALLBACK_SECRET`). Unset disables the check (dev only).
    pub webhook_secret: Option<String>,
    /// Public URL handed to providers for their callbacks
    /// (`PROVIDER_CALLBACK_URL`).
    pub callback_url: Option<String>,
    /// KIE credentials (`KIE_API_KEY`, `KIE_BASE_URL`).
    pub kie_api_key: Option<String>,
    pub kie_base_url: Option<String>,
    /// Max in-flight calls per provider scope (`GEN_PROVIDER_CONCURRENCY`).
    pub provider_concurrency: usize,
    /// Semaphore wait budget before giving up.
    pub acquire_timeout: Duration,
    /// Hard timeout for one provider wire call.
    pub call_timeout: Duration,
    /// Circuit breaker tuning (`BREAKER_FAILURE_THRESHOLD`,
    /// `BREAKER_COOLDOWN_SECS`).
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Durable stores over `DATABASE_URL` when `USE_PERSISTENT_STORES=true`.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    /// Background reconciliation sweep (disabled in tests).
    pub reconcile_enabled: bool,
    /// Per-job bounded poll task after submission (disabled in tests).
    pub background_poll_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("LUMAGEN_BIND", "0.0.0.0:8080"),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                tracing::warn!("JWT_SECRET not set; using insecure dev default");
                "dev-secret".to_string()
            }),
            webhook_secret: env_opt("PROVIDER_CALLBACK_SECRET"),
            callback_url: env_opt("PROVIDER_CALLBACK_URL"),
            kie_api_key: env_opt("KIE_API_KEY"),
            kie_base_url: env_opt("KIE_BASE_URL"),
            provider_concurrency: env_parse("GEN_PROVIDER_CONCURRENCY", 2),
            acquire_timeout: Duration::from_secs(env_parse("GEN_ACQUIRE_TIMEOUT_SECS", 5)),
            call_timeout: Duration::from_secs(env_parse("GEN_CALL_TIMEOUT_SECS", 30)),
            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_cooldown: Duration::from_secs(env_parse("BREAKER_COOLDOWN_SECS", 30)),
            use_persistent_stores: env_parse("USE_PERSISTENT_STORES", false),
            database_url: env_opt("DATABASE_URL"),
            reconcile_enabled: env_parse("RECONCILE_ENABLED", true),
            background_poll_enabled: env_parse("BACKGROUND_POLL_ENABLED", true),
        }
    }

    /// Defaults suitable for tests: in-memory stores, no background worker.
    pub fn for_tests(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: jwt_secret.into(),
            webhook_secret: Some("test-callback-secret".to_string()),
            callback_url: None,
            kie_api_key: None,
            kie_base_url: None,
            provider_concurrency: 2,
            acquire_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            use_persistent_stores: false,
            database_url: None,
            reconcile_enabled: false,
            background_poll_enabled: false,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
