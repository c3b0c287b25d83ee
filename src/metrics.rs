//! In-process metrics: atomic counters on the hot path, snapshot assembly
//! off it.
//!
//! Counters and latency aggregates are plain atomics; the only locking
//! happens while composing a snapshot, and no I/O runs under a lock. A
//! periodic reporter emits the snapshot and evaluates the alert thresholds.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

// Alert thresholds.
const LOW_HIT_RATE: f64 = 0.8;
const HIGH_ERROR_RATE: f64 = 0.05;
const HIGH_AVG_LATENCY_MS: f64 = 100.0;
const LOW_STOCK_THRESHOLD: i64 = 10;

/// Severity attached to an alert, mapped to the log level it is emitted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
}

#[derive(Default)]
struct LatencyAgg {
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    sum_ns: AtomicU64,
    count: AtomicU64,
}

impl LatencyAgg {
    fn observe(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ActivityStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    stock: AtomicI64,
}

/// Latency summary for one operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySnapshot {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivitySnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub stock: i64,
}

/// Full exportable state; serialized as JSON and rendered as key=value text.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub dropped_writes: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub operations: std::collections::BTreeMap<String, LatencySnapshot>,
    pub activities: std::collections::BTreeMap<String, ActivitySnapshot>,
}

#[derive(Default)]
pub struct MetricsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    dropped_writes: AtomicU64,
    operations: DashMap<&'static str, LatencyAgg>,
    activities: DashMap<String, ActivityStats>,
    started_at: Option<Instant>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Write-behind queue overflow; the hot-store write still succeeded.
    pub fn record_dropped_write(&self) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe(&self, operation: &'static str, elapsed: Duration) {
        self.operations
            .entry(operation)
            .or_insert_with(|| LatencyAgg {
                min_ns: AtomicU64::new(u64::MAX),
                ..Default::default()
            })
            .observe(elapsed);
    }

    pub fn record_request(&self, activity_id: &str) {
        self.activity(activity_id)
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, activity_id: &str) {
        self.activity(activity_id)
            .successes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, activity_id: &str) {
        self.activity(activity_id)
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_stock(&self, activity_id: &str, stock: i64) {
        self.activity(activity_id).stock.store(stock, Ordering::Relaxed);
    }

    fn activity(&self, activity_id: &str) -> dashmap::mapref::one::RefMut<'_, String, ActivityStats> {
        self.activities
            .entry(activity_id.to_string())
            .or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let sets = self.sets.load(Ordering::Relaxed);
        let deletes = self.deletes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let reads = hits + misses;
        let total_ops = reads + sets + deletes;

        let operations = self
            .operations
            .iter()
            .map(|entry| {
                let count = entry.count.load(Ordering::Relaxed);
                let sum = entry.sum_ns.load(Ordering::Relaxed);
                let min = entry.min_ns.load(Ordering::Relaxed);
                (
                    entry.key().to_string(),
                    LatencySnapshot {
                        min_ns: if count == 0 { 0 } else { min },
                        max_ns: entry.max_ns.load(Ordering::Relaxed),
                        avg_ns: if count == 0 { 0 } else { sum / count },
                        count,
                    },
                )
            })
            .collect();

        let activities = self
            .activities
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    ActivitySnapshot {
                        requests: entry.requests.load(Ordering::Relaxed),
                        successes: entry.successes.load(Ordering::Relaxed),
                        failures: entry.failures.load(Ordering::Relaxed),
                        stock: entry.stock.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_secs: self
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            hits,
            misses,
            sets,
            deletes,
            errors,
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            hit_rate: if reads == 0 {
                1.0
            } else {
                hits as f64 / reads as f64
            },
            error_rate: if total_ops == 0 {
                0.0
            } else {
                errors as f64 / total_ops as f64
            },
            operations,
            activities,
        }
    }

    /// Zero all counters. Guarded by admin authorization at the HTTP layer.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.dropped_writes.store(0, Ordering::Relaxed);
        self.operations.clear();
        self.activities.clear();
    }

    /// Evaluate alert thresholds against a snapshot.
    pub fn check_alerts(snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let reads = snapshot.hits + snapshot.misses;

        if reads > 0 && snapshot.hit_rate < LOW_HIT_RATE {
            alerts.push(Alert {
                severity: Severity::Warning,
                code: "low_hit_rate",
                message: format!("cache hit rate {:.3} below {LOW_HIT_RATE}", snapshot.hit_rate),
            });
        }
        if snapshot.error_rate > HIGH_ERROR_RATE {
            alerts.push(Alert {
                severity: Severity::Error,
                code: "high_error_rate",
                message: format!(
                    "error rate {:.3} above {HIGH_ERROR_RATE}",
                    snapshot.error_rate
                ),
            });
        }
        for (op, latency) in &snapshot.operations {
            let avg_ms = latency.avg_ns as f64 / 1_000_000.0;
            if latency.count > 0 && avg_ms > HIGH_AVG_LATENCY_MS {
                alerts.push(Alert {
                    severity: Severity::Error,
                    code: "high_latency",
                    message: format!("{op} avg latency {avg_ms:.1}ms above {HIGH_AVG_LATENCY_MS}ms"),
                });
            }
        }
        for (activity, stats) in &snapshot.activities {
            if stats.stock == 0 && stats.requests > 0 {
                alerts.push(Alert {
                    severity: Severity::Critical,
                    code: "out_of_stock",
                    message: format!("activity {activity} is out of stock"),
                });
            } else if stats.stock > 0 && stats.stock < LOW_STOCK_THRESHOLD {
                alerts.push(Alert {
                    severity: Severity::Warning,
                    code: "low_stock",
                    message: format!("activity {activity} stock down to {}", stats.stock),
                });
            }
        }
        alerts
    }

    /// Flat `key=value` rendering for scrapers.
    pub fn export_text(snapshot: &MetricsSnapshot) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: String| {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        };
        push("uptime_secs", snapshot.uptime_secs.to_string());
        push("cache_hits", snapshot.hits.to_string());
        push("cache_misses", snapshot.misses.to_string());
        push("cache_sets", snapshot.sets.to_string());
        push("cache_deletes", snapshot.deletes.to_string());
        push("errors", snapshot.errors.to_string());
        push("dropped_writes", snapshot.dropped_writes.to_string());
        push("hit_rate", format!("{:.4}", snapshot.hit_rate));
        push("error_rate", format!("{:.4}", snapshot.error_rate));
        for (op, latency) in &snapshot.operations {
            push(&format!("op_{op}_count"), latency.count.to_string());
            push(&format!("op_{op}_avg_ns"), latency.avg_ns.to_string());
            push(&format!("op_{op}_max_ns"), latency.max_ns.to_string());
        }
        for (activity, stats) in &snapshot.activities {
            push(&format!("activity_{activity}_requests"), stats.requests.to_string());
            push(
                &format!("activity_{activity}_successes"),
                stats.successes.to_string(),
            );
            push(
                &format!("activity_{activity}_failures"),
                stats.failures.to_string(),
            );
            push(&format!("activity_{activity}_stock"), stats.stock.to_string());
        }
        out
    }

    /// Periodic reporter: logs the snapshot and emits alerts at their
    /// mapped severities.
    pub async fn run_reporter(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            let snapshot = self.snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => tracing::info!(target: "METRICS", snapshot = %json, "periodic snapshot"),
                Err(e) => tracing::error!(target: "METRICS", "snapshot serialization failed: {e}"),
            }
            for alert in Self::check_alerts(&snapshot) {
                match alert.severity {
                    Severity::Warning => {
                        tracing::warn!(target: "METRICS", code = alert.code, "{}", alert.message)
                    }
                    Severity::Error => {
                        tracing::error!(target: "METRICS", code = alert.code, "{}", alert.message)
                    }
                    Severity::Critical => tracing::error!(
                        target: "METRICS",
                        code = alert.code,
                        critical = true,
                        "{}",
                        alert.message
                    ),
                }
            }
        }
    }
}
