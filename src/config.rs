use std::str::FromStr;
use std::time::Duration;

use crate::utils::RetryConfig;

/// Application configuration, read once at startup.
///
/// # Environment variables
///
/// | Variable | Default | Notes |
/// |----------|---------|-------|
/// | HTTP_PORT | 8080 | webhook + metrics listener |
/// | SCYLLA_NODES | 127.0.0.1:9042 | comma separated |
/// | SCYLLA_KEYSPACE | orders_ks | |
/// | MARKETPLACE_A_APP_KEY | (empty) | HMAC base-string prefix |
/// | MARKETPLACE_A_APP_SECRET | (empty) | HMAC key; empty rejects everything |
/// | MARKETPLACE_B_TOKENS | (empty) | comma separated credential set |
/// | MARKETPLACE_C_TOKENS | (empty) | comma separated credential set |
/// | DISPATCH_WORKERS | 8 | concurrent reconciliations |
/// | DISPATCH_QUEUE_CAPACITY | 64 | per order key |
/// | DISPATCH_SUBMIT_TIMEOUT_MS | 2000 | wait for queue space before `Overloaded` |
/// | DISPATCH_IDLE_EVICT_MS | 30000 | idle key queues are dropped after this |
/// | STORE_RETRY_MAX_ATTEMPTS | 5 | |
/// | STORE_RETRY_INITIAL_DELAY_MS | 50 | |
/// | STORE_RETRY_MAX_DELAY_MS | 5000 | |
/// | STORE_RETRY_MULTIPLIER | 2.0 | |
/// | RECONCILE_MAX_CONFLICT_RETRIES | 5 | |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_port: u16,
    pub scylla_nodes: Vec<String>,
    pub scylla_keyspace: String,
    pub credentials: PlatformCredentials,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Default)]
pub struct HmacCredentials {
    pub app_key: String,
    pub app_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct TokenCredentials {
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformCredentials {
    pub marketplace_a: HmacCredentials,
    pub marketplace_b: TokenCredentials,
    pub marketplace_c: TokenCredentials,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_timeout: Duration,
    pub idle_eviction: Duration,
    pub store_retry: RetryConfig,
    pub max_conflict_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            submit_timeout: Duration::from_millis(2000),
            idle_eviction: Duration::from_millis(30_000),
            store_retry: RetryConfig::default(),
            max_conflict_retries: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; missing or unparsable
    /// values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let list = |name: &str| {
            lookup(name)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let retry_defaults = RetryConfig::default();
        let dispatch_defaults = DispatcherConfig::default();

        let scylla_nodes = list("SCYLLA_NODES");

        Self {
            http_port: parse_var(&lookup, "HTTP_PORT").unwrap_or(8080),
            scylla_nodes: if scylla_nodes.is_empty() {
                vec!["127.0.0.1:9042".to_string()]
            } else {
                scylla_nodes
            },
            scylla_keyspace: lookup("SCYLLA_KEYSPACE").unwrap_or_else(|| "orders_ks".into()),
            credentials: PlatformCredentials {
                marketplace_a: HmacCredentials {
                    app_key: lookup("MARKETPLACE_A_APP_KEY").unwrap_or_default(),
                    app_secret: lookup("MARKETPLACE_A_APP_SECRET").unwrap_or_default(),
                },
                marketplace_b: TokenCredentials { tokens: list("MARKETPLACE_B_TOKENS") },
                marketplace_c: TokenCredentials { tokens: list("MARKETPLACE_C_TOKENS") },
            },
            dispatcher: DispatcherConfig {
                workers: parse_var(&lookup, "DISPATCH_WORKERS")
                    .filter(|n: &usize| *n > 0)
                    .unwrap_or(dispatch_defaults.workers),
                queue_capacity: parse_var(&lookup, "DISPATCH_QUEUE_CAPACITY")
                    .filter(|n: &usize| *n > 0)
                    .unwrap_or(dispatch_defaults.queue_capacity),
                submit_timeout: parse_var(&lookup, "DISPATCH_SUBMIT_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(dispatch_defaults.submit_timeout),
                idle_eviction: parse_var(&lookup, "DISPATCH_IDLE_EVICT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(dispatch_defaults.idle_eviction),
                store_retry: RetryConfig {
                    max_attempts: parse_var(&lookup, "STORE_RETRY_MAX_ATTEMPTS")
                        .filter(|n: &u32| *n > 0)
                        .unwrap_or(retry_defaults.max_attempts),
                    initial_delay: parse_var(&lookup, "STORE_RETRY_INITIAL_DELAY_MS")
                        .map(Duration::from_millis)
                        .unwrap_or(retry_defaults.initial_delay),
                    max_delay: parse_var(&lookup, "STORE_RETRY_MAX_DELAY_MS")
                        .map(Duration::from_millis)
                        .unwrap_or(retry_defaults.max_delay),
                    multiplier: parse_var(&lookup, "STORE_RETRY_MULTIPLIER").unwrap_or(retry_defaults.multiplier),
                },
                max_conflict_retries: parse_var(&lookup, "RECONCILE_MAX_CONFLICT_RETRIES")
                    .unwrap_or(dispatch_defaults.max_conflict_retries),
            },
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}
