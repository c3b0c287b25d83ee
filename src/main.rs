//! seckill-engine entry point.
//!
//! Startup order:
//!
//! ```text
//! ┌────────┐   ┌─────────┐   ┌────────────┐   ┌───────────┐   ┌─────────┐
//! │ Config │──▶│ Logging │──▶│ Hot store  │──▶│ Broker    │──▶│ Gateway │
//! │ (env)  │   │         │   │ (redis)    │   │ (NATS)    │   │ (axum)  │
//! └────────┘   └─────────┘   └────────────┘   └───────────┘   └─────────┘
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 hot store or
//! broker unreachable after bounded startup retries.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use seckill_engine::cache::{CacheManager, TtlPolicy, WriteBehindQueue};
use seckill_engine::config::AppConfig;
use seckill_engine::dispatch::NatsDispatcher;
use seckill_engine::gateway::{self, AppState};
use seckill_engine::limiter::MultiTierLimiter;
use seckill_engine::metrics::MetricsCollector;
use seckill_engine::reconciler::{
    ConsistencyReconciler, ReconcileTarget, ReconcilerConfig,
};
use seckill_engine::reservation::{ReservationConfig, ReservationEngine};
use seckill_engine::source::HttpSource;
use seckill_engine::store::{HotStore, RedisStore};
use seckill_engine::worker::WorkerPool;

const STARTUP_ATTEMPTS: u32 = 5;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BUCKET_MAX_IDLE: Duration = Duration::from_secs(600);
const WRITE_BEHIND_INTERVAL: Duration = Duration::from_millis(200);
const WRITE_BEHIND_BATCH: usize = 128;
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    // [1] Configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    // [2] Logging (guard must outlive the server for the file writer)
    let _log_guard = seckill_engine::logging::init_logging(&config);
    tracing::info!(version = env!("GIT_HASH"), "seckill-engine starting");

    // [3] Hot store
    let store: Arc<RedisStore> = match connect_store(&config).await {
        Some(store) => Arc::new(store),
        None => return ExitCode::from(2),
    };

    // [4] Broker
    let dispatcher: Arc<NatsDispatcher> = match connect_broker(&config).await {
        Some(dispatcher) => Arc::new(dispatcher),
        None => return ExitCode::from(2),
    };

    // [5] Components
    let metrics = Arc::new(MetricsCollector::new());
    let hot_store: Arc<dyn HotStore> = store.clone();

    let source = config
        .source_of_record_url
        .as_deref()
        .map(|url| Arc::new(HttpSource::new(url)));

    let write_behind = source.as_ref().map(|source| {
        Arc::new(WriteBehindQueue::new(
            config.dispatch_buffer,
            source.clone(),
            metrics.clone(),
        ))
    });

    let mut cache = CacheManager::new(
        hot_store.clone(),
        metrics.clone(),
        TtlPolicy {
            activity: Duration::from_secs(config.cache_ttl_activity),
            stock_override: Duration::from_secs(config.cache_ttl_stock),
            user_extra: Duration::from_secs(config.cache_ttl_user),
        },
    );
    if let Some(source) = &source {
        cache = cache
            .with_loader(source.clone())
            .with_source_writer(source.clone());
    }
    if let Some(queue) = &write_behind {
        cache = cache.with_write_behind(queue.clone());
    }
    let cache = Arc::new(cache);

    let limiter = Arc::new(MultiTierLimiter::new(config.rate_limits));
    let pool = Arc::new(WorkerPool::new(
        config.worker_pool_size,
        config.worker_queue_size,
    ));

    let engine = Arc::new(ReservationEngine::new(
        hot_store.clone(),
        dispatcher.clone(),
        cache.clone(),
        metrics.clone(),
        ReservationConfig {
            deadline: config.request_deadline,
            ..ReservationConfig::default()
        },
    ));

    let reconciler = Arc::new(ConsistencyReconciler::new(
        hot_store.clone(),
        metrics.clone(),
        ReconcilerConfig {
            interval: config.reconciler_interval,
            alert_threshold: config.reconciler_alert_threshold,
            ..ReconcilerConfig::default()
        },
    ));
    if let Some(source) = &source {
        if !config.reconciler_keys.is_empty() {
            reconciler.register(ReconcileTarget {
                name: "configured".to_string(),
                keys: config.reconciler_keys.clone(),
                loader: source.clone(),
            });
            tracing::info!(
                keys = config.reconciler_keys.len(),
                "reconciler watching configured keys"
            );
        }
    } else {
        tracing::warn!("no SOURCE_OF_RECORD_URL configured; reconciler and write strategies idle");
    }

    // [6] Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(reconciler.clone().run(shutdown_rx.clone()));
    tokio::spawn(
        metrics
            .clone()
            .run_reporter(config.metrics_interval, shutdown_rx.clone()),
    );
    tokio::spawn(limiter.clone().run_sweeper(
        SWEEP_INTERVAL,
        BUCKET_MAX_IDLE,
        shutdown_rx.clone(),
    ));
    tokio::spawn(dispatcher.clone().run_flusher(shutdown_rx.clone()));
    // Held so shutdown can await the final drain pass.
    let drain_handle = write_behind.as_ref().map(|queue| {
        tokio::spawn(queue.clone().run_drain(
            WRITE_BEHIND_INTERVAL,
            WRITE_BEHIND_BATCH,
            shutdown_rx.clone(),
        ))
    });

    // [7] Serve
    let state = Arc::new(AppState {
        engine,
        limiter,
        cache,
        metrics,
        pool: pool.clone(),
        store: hot_store,
        loader: source.map(|s| s as Arc<dyn seckill_engine::source::DataLoader>),
        admin_token: config.admin_token.clone(),
        request_deadline: config.request_deadline,
    });

    let served = gateway::run_server(
        state,
        config.server_port,
        &config.cors_origins,
        shutdown_signal(),
    )
    .await;

    if let Err(err) = served {
        tracing::error!("server failed to start: {err}");
        return ExitCode::from(2);
    }

    // [8] Graceful shutdown: stop intake, drain workers and buffers.
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    pool.shutdown(DRAIN_DEADLINE).await;
    if let Some(handle) = drain_handle {
        match tokio::time::timeout(DRAIN_DEADLINE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("write-behind drain task failed: {err}"),
            Err(_) => {
                let pending = write_behind.as_ref().map(|q| q.pending()).unwrap_or(0);
                tracing::warn!(pending, "write-behind drain deadline hit");
            }
        }
    }
    let flushed = dispatcher.flush_once().await;
    if flushed > 0 || dispatcher.buffered() > 0 {
        tracing::info!(
            flushed,
            parked = dispatcher.buffered(),
            "dispatcher buffer final flush"
        );
    }
    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn connect_store(config: &AppConfig) -> Option<RedisStore> {
    for attempt in 1..=STARTUP_ATTEMPTS {
        match RedisStore::connect(&config.hot_store_addr, config.hot_store_pool).await {
            Ok(store) => {
                tracing::info!(addr = %config.hot_store_addr, pool = config.hot_store_pool, "hot store connected");
                return Some(store);
            }
            Err(err) => {
                tracing::error!(attempt, "hot store connect failed: {err}");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
    }
    tracing::error!(
        addr = %config.hot_store_addr,
        "hot store unreachable after {STARTUP_ATTEMPTS} attempts"
    );
    None
}

async fn connect_broker(config: &AppConfig) -> Option<NatsDispatcher> {
    for attempt in 1..=STARTUP_ATTEMPTS {
        match NatsDispatcher::connect(
            &config.broker_url,
            &config.broker_subject,
            config.dispatch_buffer,
        )
        .await
        {
            Ok(dispatcher) => {
                tracing::info!(url = %config.broker_url, subject = %config.broker_subject, "broker connected");
                return Some(dispatcher);
            }
            Err(err) => {
                tracing::error!(attempt, "broker connect failed: {err}");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
    }
    tracing::error!(url = %config.broker_url, "broker unreachable after {STARTUP_ATTEMPTS} attempts");
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl-c handler failed: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("SIGTERM handler failed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
