//! System-of-record access.
//!
//! The engine never talks to the administrative database directly; it sees
//! two small capabilities, registered at startup:
//!
//! - [`DataLoader`]: read a key's authoritative value and judge a cached
//!   value against it (consumed by the reconciler and refresh-ahead reads).
//! - [`SourceWriter`]: persist a value (consumed by the write-through and
//!   write-behind strategies).
//!
//! Transport is pluggable; [`HttpSource`] speaks the admin service's REST
//! surface, [`MemorySource`] backs the test suite.

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("system of record unavailable: {0}")]
    Unavailable(String),

    #[error("system of record rejected {key}: {reason}")]
    Rejected { key: String, reason: String },
}

/// Verdict on one cache entry versus its authoritative value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueCheck {
    Consistent,
    Mismatch { cached: String, source: String },
    MissingInCache { source: String },
    MissingInSource { cached: String },
    BothMissing,
}

impl ValueCheck {
    pub fn is_consistent(&self) -> bool {
        // A key absent on both sides has nothing to repair.
        matches!(self, ValueCheck::Consistent | ValueCheck::BothMissing)
    }
}

#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Fetch the authoritative value for a cache key. `Ok(None)` means the
    /// source has no such record.
    async fn load_from_source(&self, key: &str) -> Result<Option<String>, SourceError>;

    /// Compare a cached value against the source value.
    ///
    /// The default compares JSON structurally when both sides parse, so key
    /// ordering and whitespace differences do not count as drift; otherwise
    /// it falls back to string equality.
    fn validate(&self, cached: Option<&str>, source: Option<&str>) -> ValueCheck {
        match (cached, source) {
            (None, None) => ValueCheck::BothMissing,
            (None, Some(s)) => ValueCheck::MissingInCache {
                source: s.to_string(),
            },
            (Some(c), None) => ValueCheck::MissingInSource {
                cached: c.to_string(),
            },
            (Some(c), Some(s)) => {
                let equal = match (
                    serde_json::from_str::<serde_json::Value>(c),
                    serde_json::from_str::<serde_json::Value>(s),
                ) {
                    (Ok(cv), Ok(sv)) => cv == sv,
                    _ => c == s,
                };
                if equal {
                    ValueCheck::Consistent
                } else {
                    ValueCheck::Mismatch {
                        cached: c.to_string(),
                        source: s.to_string(),
                    }
                }
            }
        }
    }
}

#[async_trait]
pub trait SourceWriter: Send + Sync {
    /// Persist a value to the system of record.
    async fn persist(&self, key: &str, value: &str) -> Result<(), SourceError>;
}

// ============================================================================
// HTTP transport
// ============================================================================

/// REST client for the administrative service's cache-source endpoints:
/// `GET  {base}/api/v1/internal/source/{key}` returns the raw value or 404,
/// `PUT  {base}/api/v1/internal/source/{key}` persists the request body.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/api/v1/internal/source/{}", self.base_url, key)
    }
}

#[async_trait]
impl DataLoader for HttpSource {
    async fn load_from_source(&self, key: &str) -> Result<Option<String>, SourceError> {
        let response = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "GET {key}: status {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl SourceWriter for HttpSource {
    async fn persist(&self, key: &str, value: &str) -> Result<(), SourceError> {
        let response = self
            .client
            .put(self.url_for(key))
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if response.status().is_client_error() {
            return Err(SourceError::Rejected {
                key: key.to_string(),
                reason: response.status().to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "PUT {key}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// In-memory transport (tests)
// ============================================================================

#[derive(Default)]
pub struct MemorySource {
    records: Mutex<FxHashMap<String, String>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// While set, both loads and persists fail with `Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(SourceError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataLoader for MemorySource {
    async fn load_from_source(&self, key: &str) -> Result<Option<String>, SourceError> {
        self.check_available()?;
        Ok(self.get(key))
    }
}

#[async_trait]
impl SourceWriter for MemorySource {
    async fn persist(&self, key: &str, value: &str) -> Result<(), SourceError> {
        self.check_available()?;
        self.insert(key, value);
        Ok(())
    }
}
