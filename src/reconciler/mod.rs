//! Consistency reconciler: periodic cache ↔ system-of-record comparison
//! with optional repair.
//!
//! Each cycle walks the registered targets, compares every key through the
//! target's [`DataLoader`], repairs the cache from the source when drift is
//! found, and aggregates a [`ConsistencyReport`]. Repair only ever writes
//! the cache; pushing cache values back to the system of record is the order
//! pipeline's job, never this loop's.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::metrics::MetricsCollector;
use crate::source::{DataLoader, ValueCheck};
use crate::store::{HotStore, KeyTtl};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Minimum per-cycle consistency rate before an alert fires.
    pub alert_threshold: f64,
    pub repair: bool,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            alert_threshold: 0.95,
            repair: true,
            max_retries: 3,
            retry_base: Duration::from_millis(100),
        }
    }
}

/// A named group of keys validated through one loader.
pub struct ReconcileTarget {
    pub name: String,
    pub keys: Vec<String>,
    pub loader: Arc<dyn DataLoader>,
}

/// Aggregate result of one reconcile cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub consistent: usize,
    pub rate: f64,
    pub inconsistent_keys: Vec<String>,
    pub repaired: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

pub struct ConsistencyReconciler {
    store: Arc<dyn HotStore>,
    metrics: Arc<MetricsCollector>,
    targets: Mutex<Vec<ReconcileTarget>>,
    config: ReconcilerConfig,
}

impl ConsistencyReconciler {
    pub fn new(
        store: Arc<dyn HotStore>,
        metrics: Arc<MetricsCollector>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            targets: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn register(&self, target: ReconcileTarget) {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target);
    }

    /// Add keys to an existing target (new activities seen after startup).
    pub fn add_keys(&self, target_name: &str, keys: impl IntoIterator<Item = String>) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(target) = targets.iter_mut().find(|t| t.name == target_name) {
            for key in keys {
                if !target.keys.contains(&key) {
                    target.keys.push(key);
                }
            }
        }
    }

    /// Run one full comparison cycle over every registered target.
    pub async fn run_cycle(&self) -> ConsistencyReport {
        let started = Instant::now();
        // Snapshot the work list, then drop the lock before any I/O.
        let work: Vec<(String, Vec<String>, Arc<dyn DataLoader>)> = {
            let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
            targets
                .iter()
                .map(|t| (t.name.clone(), t.keys.clone(), Arc::clone(&t.loader)))
                .collect()
        };

        let mut checked = 0;
        let mut consistent = 0;
        let mut repaired = 0;
        let mut errors = 0;
        let mut inconsistent_keys = Vec::new();

        for (target_name, keys, loader) in work {
            for key in keys {
                checked += 1;
                let cached = match self.store.get(&key).await {
                    Ok(value) => value,
                    Err(err) => {
                        errors += 1;
                        self.metrics.record_error();
                        tracing::warn!(target: "RECONCILER", key = %key, "cache read failed: {err}");
                        continue;
                    }
                };
                let source = match loader.load_from_source(&key).await {
                    Ok(value) => value,
                    Err(err) => {
                        errors += 1;
                        self.metrics.record_error();
                        tracing::warn!(target: "RECONCILER", key = %key, "source load failed: {err}");
                        continue;
                    }
                };

                let check = loader.validate(cached.as_deref(), source.as_deref());
                if check.is_consistent() {
                    consistent += 1;
                    continue;
                }

                tracing::warn!(
                    target: "RECONCILER",
                    key = %key,
                    reconcile_target = %target_name,
                    "cache drift detected: {check:?}"
                );
                inconsistent_keys.push(key.clone());

                if self.config.repair && self.repair_key(&key, source.as_deref()).await {
                    repaired += 1;
                }
            }
        }

        let compared = checked - errors;
        let report = ConsistencyReport {
            checked,
            consistent,
            rate: if compared == 0 {
                1.0
            } else {
                consistent as f64 / compared as f64
            },
            inconsistent_keys,
            repaired,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if report.rate < self.config.alert_threshold {
            tracing::error!(
                target: "RECONCILER",
                rate = report.rate,
                threshold = self.config.alert_threshold,
                inconsistent = report.inconsistent_keys.len(),
                "consistency rate below alert threshold"
            );
        } else {
            tracing::info!(
                target: "RECONCILER",
                checked = report.checked,
                consistent = report.consistent,
                repaired = report.repaired,
                duration_ms = report.duration_ms,
                "reconcile cycle complete"
            );
        }
        report
    }

    /// Overwrite (or remove) the cache entry from the source value,
    /// preserving any remaining TTL. Retries with backoff.
    async fn repair_key(&self, key: &str, source: Option<&str>) -> bool {
        for attempt in 0..=self.config.max_retries {
            let result = match source {
                Some(value) => {
                    let ttl = match self.store.ttl(key).await {
                        Ok(KeyTtl::Expires(remaining)) => Some(remaining),
                        _ => None,
                    };
                    self.store.set(key, value, ttl).await
                }
                None => self.store.del(key).await.map(|_| ()),
            };
            match result {
                Ok(()) => {
                    tracing::info!(target: "RECONCILER", key = %key, "cache repaired from source");
                    return true;
                }
                Err(err) if attempt < self.config.max_retries => {
                    tracing::warn!(
                        target: "RECONCILER",
                        key = %key,
                        attempt,
                        "repair failed, backing off: {err}"
                    );
                    tokio::time::sleep(self.config.retry_base * (attempt + 1)).await;
                }
                Err(err) => {
                    tracing::error!(target: "RECONCILER", key = %key, "repair gave up: {err}");
                    return false;
                }
            }
        }
        false
    }

    /// Background loop at the configured interval.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.run_cycle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys;
    use crate::source::MemorySource;
    use crate::store::MemoryStore;

    fn reconciler(
        store: Arc<MemoryStore>,
        repair: bool,
    ) -> (ConsistencyReconciler, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let reconciler = ConsistencyReconciler::new(
            store,
            Arc::new(MetricsCollector::new()),
            ReconcilerConfig {
                repair,
                retry_base: Duration::from_millis(5),
                ..ReconcilerConfig::default()
            },
        );
        reconciler.register(ReconcileTarget {
            name: "stock".to_string(),
            keys: vec![keys::stock("A")],
            loader: source.clone(),
        });
        (reconciler, source)
    }

    #[tokio::test]
    async fn test_drift_is_repaired_from_source() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, source) = reconciler(store.clone(), true);

        store.set(&keys::stock("A"), "3", None).await.unwrap();
        source.insert(&keys::stock("A"), "5");

        let report = reconciler.run_cycle().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.consistent, 0);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.inconsistent_keys, vec![keys::stock("A")]);
        assert!(report.rate < 0.95);

        assert_eq!(
            store.get(&keys::stock("A")).await.unwrap().as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_consistent_cycle_reports_full_rate() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, source) = reconciler(store.clone(), true);

        store.set(&keys::stock("A"), "7", None).await.unwrap();
        source.insert(&keys::stock("A"), "7");

        let report = reconciler.run_cycle().await;
        assert_eq!(report.consistent, 1);
        assert_eq!(report.rate, 1.0);
        assert!(report.inconsistent_keys.is_empty());
    }

    #[tokio::test]
    async fn test_missing_in_source_removes_cache_entry() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, _source) = reconciler(store.clone(), true);

        store.set(&keys::stock("A"), "9", None).await.unwrap();
        let report = reconciler.run_cycle().await;
        assert_eq!(report.repaired, 1);
        assert_eq!(store.get(&keys::stock("A")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repair_disabled_leaves_cache_alone() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, source) = reconciler(store.clone(), false);

        store.set(&keys::stock("A"), "3", None).await.unwrap();
        source.insert(&keys::stock("A"), "5");

        let report = reconciler.run_cycle().await;
        assert_eq!(report.repaired, 0);
        assert_eq!(
            store.get(&keys::stock("A")).await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_source_outage_counts_errors_not_drift() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, source) = reconciler(store.clone(), true);
        store.set(&keys::stock("A"), "3", None).await.unwrap();
        source.set_failing(true);

        let report = reconciler.run_cycle().await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.rate, 1.0);
        assert!(report.inconsistent_keys.is_empty());
    }
}
