//! Runtime configuration, populated from environment variables at startup.
//!
//! Every recognized variable is enumerated here; nothing reads the
//! environment elsewhere. Parse failures are collected so the operator sees
//! all of them in one pass, and the process exits with code 1.
//!
//! | Variable | Effect | Default |
//! |----------|--------|---------|
//! | `SERVER_PORT` | HTTP bind port | 8080 |
//! | `HOT_STORE_ADDR` | redis connection URL | redis://127.0.0.1:6379 |
//! | `HOT_STORE_POOL` | connection pool size hint | 16 |
//! | `BROKER_URL` | NATS endpoint | nats://127.0.0.1:4222 |
//! | `RL_GLOBAL_QPS` / `RL_IP_QPS` / `RL_USER_QPS` | tier refill rates | 10000 / 50 / 1 |
//! | `WORKER_POOL_SIZE` | reservation worker count | 2x CPUs |
//! | `CACHE_TTL_ACTIVITY` / `CACHE_TTL_STOCK` / `CACHE_TTL_USER` | TTL seconds | 86400 / 0 (activity-bounded) / 86400 |
//! | `RECONCILER_INTERVAL` | reconcile cycle seconds | 60 |
//! | `RECONCILER_ALERT_THRESHOLD` | min consistency rate | 0.95 |
//! | `METRICS_INTERVAL` | snapshot cadence seconds | 30 |

use std::time::Duration;

use thiserror::Error;

use crate::limiter::{BucketSpec, TierTemplates};

#[derive(Error, Debug)]
#[error("configuration error:\n{}", issues.join("\n"))]
pub struct ConfigError {
    pub issues: Vec<String>,
}

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // HTTP front
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub admin_token: Option<String>,
    pub request_deadline: Duration,

    // Hot store
    pub hot_store_addr: String,
    pub hot_store_pool: usize,

    // Broker
    pub broker_url: String,
    pub broker_subject: String,
    pub dispatch_buffer: usize,

    // Rate limiter tiers
    pub rate_limits: TierTemplates,

    // Worker pool
    pub worker_pool_size: usize,
    pub worker_queue_size: usize,

    // Cache TTL policy (seconds; stock 0 = bounded by activity end)
    pub cache_ttl_activity: u64,
    pub cache_ttl_stock: u64,
    pub cache_ttl_user: u64,

    // Reconciler
    pub reconciler_interval: Duration,
    pub reconciler_alert_threshold: f64,
    /// Hot-store keys the reconciler watches (RECONCILER_KEYS, comma-separated).
    pub reconciler_keys: Vec<String>,
    pub source_of_record_url: Option<String>,

    // Metrics
    pub metrics_interval: Duration,

    // Logging
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    pub rotation: String,
    pub use_json: bool,
}

impl AppConfig {
    /// Read and validate the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut issues = Vec::new();

        let server_port = parse_var(&mut issues, "SERVER_PORT", 8080u16);
        let hot_store_addr = string_var("HOT_STORE_ADDR", "redis://127.0.0.1:6379");
        let hot_store_pool = parse_var(&mut issues, "HOT_STORE_POOL", 16usize);
        let broker_url = string_var("BROKER_URL", "nats://127.0.0.1:4222");
        let broker_subject = string_var("BROKER_SUBJECT", "seckill.reservations");
        let dispatch_buffer = parse_var(&mut issues, "DISPATCH_BUFFER", 4096usize);

        let rl_global = parse_var(&mut issues, "RL_GLOBAL_QPS", 10_000f64);
        let rl_ip = parse_var(&mut issues, "RL_IP_QPS", 50f64);
        let rl_user = parse_var(&mut issues, "RL_USER_QPS", 1f64);
        for (name, rate) in [
            ("RL_GLOBAL_QPS", rl_global),
            ("RL_IP_QPS", rl_ip),
            ("RL_USER_QPS", rl_user),
        ] {
            if rate <= 0.0 {
                issues.push(format!("{name} must be > 0, got {rate}"));
            }
        }

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8);
        let worker_pool_size = parse_var(&mut issues, "WORKER_POOL_SIZE", default_workers);
        let worker_queue_size = parse_var(&mut issues, "WORKER_QUEUE_SIZE", 1024usize);
        if worker_pool_size == 0 {
            issues.push("WORKER_POOL_SIZE must be > 0".to_string());
        }

        let cache_ttl_activity = parse_var(&mut issues, "CACHE_TTL_ACTIVITY", 86_400u64);
        let cache_ttl_stock = parse_var(&mut issues, "CACHE_TTL_STOCK", 0u64);
        let cache_ttl_user = parse_var(&mut issues, "CACHE_TTL_USER", 86_400u64);

        let reconciler_interval = parse_var(&mut issues, "RECONCILER_INTERVAL", 60u64);
        let reconciler_alert_threshold =
            parse_var(&mut issues, "RECONCILER_ALERT_THRESHOLD", 0.95f64);
        if !(0.0..=1.0).contains(&reconciler_alert_threshold) {
            issues.push(format!(
                "RECONCILER_ALERT_THRESHOLD must be within [0, 1], got {reconciler_alert_threshold}"
            ));
        }

        let metrics_interval = parse_var(&mut issues, "METRICS_INTERVAL", 30u64);
        let request_deadline_ms = parse_var(&mut issues, "REQUEST_DEADLINE_MS", 2_000u64);

        let cors_origins = std::env::var("CORS_ORIGINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = AppConfig {
            server_port,
            cors_origins,
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            request_deadline: Duration::from_millis(request_deadline_ms),
            hot_store_addr,
            hot_store_pool,
            broker_url,
            broker_subject,
            dispatch_buffer,
            rate_limits: TierTemplates {
                // Burst capacity follows the refill rate: one second of traffic
                // for the wide tiers, a minimum burst of one for the user tier.
                global: BucketSpec {
                    capacity: rl_global.max(1.0),
                    refill_rate: rl_global,
                },
                address: BucketSpec {
                    capacity: rl_ip.max(1.0),
                    refill_rate: rl_ip,
                },
                user: BucketSpec {
                    capacity: rl_user.max(1.0),
                    refill_rate: rl_user,
                },
            },
            worker_pool_size,
            worker_queue_size,
            cache_ttl_activity,
            cache_ttl_stock,
            cache_ttl_user,
            reconciler_interval: Duration::from_secs(reconciler_interval),
            reconciler_alert_threshold,
            reconciler_keys: std::env::var("RECONCILER_KEYS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            source_of_record_url: std::env::var("SOURCE_OF_RECORD_URL")
                .ok()
                .filter(|u| !u.is_empty()),
            metrics_interval: Duration::from_secs(metrics_interval),
            log_dir: string_var("LOG_DIR", "logs"),
            log_file: string_var("LOG_FILE", "seckill-engine.log"),
            log_level: string_var("LOG_LEVEL", "info"),
            rotation: string_var("LOG_ROTATION", "daily"),
            use_json: parse_var(&mut issues, "LOG_JSON", false),
        };

        if issues.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError { issues })
        }
    }
}

fn string_var(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr + Copy>(issues: &mut Vec<String>, name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                issues.push(format!("{name}: cannot parse {raw:?}"));
                default
            }
        },
        _ => default,
    }
}
