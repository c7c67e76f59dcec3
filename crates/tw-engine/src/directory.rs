//! Host directory: fetch, cache, and rank VPN endpoints
//!
//! The directory service is the single source of truth for which
//! endpoints exist and how loaded they are. Fetches are cached with a
//! short TTL so repeated selections don't hammer the service; ranking
//! against a merely stale cache is preferred over failing outright.
//!
//! Retry policy: each refresh makes at most `fetch_attempts` tries with
//! a short fixed delay. Beyond that the failure is surfaced and retried
//! only at the next user-initiated connect, never in an internal loop.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use tw_core::config::DirectoryConfig;
use tw_core::error::DirectoryError;
use tw_core::types::{Host, TargetSpec};

/// Remote directory service API
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// Fetch the full endpoint list with current load metrics
    async fn fetch_hosts(&self) -> Result<Vec<Host>, DirectoryError>;

    /// Our current public IP address, as seen by the directory service
    async fn current_ip(&self) -> Result<String, DirectoryError>;
}

/// HTTP client for the directory service
pub struct HttpDirectory {
    client: reqwest::Client,
    api_url: String,
}

/// Host record as returned by the `/servers` endpoint
#[derive(Debug, Deserialize)]
struct HostRecord {
    id: String,
    country: String,
    country_name: String,
    address: String,
    load: u8,
}

impl HttpDirectory {
    /// Build a client against the configured base URL
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tunwarden/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, endpoint: &str) -> Result<reqwest::Response, DirectoryError> {
        let url = format!("{}/{}", self.api_url, endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectory {
    async fn fetch_hosts(&self) -> Result<Vec<Host>, DirectoryError> {
        let records: Vec<HostRecord> = self
            .get("servers")
            .await?
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let now = std::time::SystemTime::now();
        let hosts = records
            .into_iter()
            .filter_map(|r| {
                let country = match tw_core::types::CountryCode::parse(&r.country) {
                    Ok(cc) => cc,
                    Err(_) => {
                        tracing::debug!(id = %r.id, country = %r.country, "skipping host with bad country code");
                        return None;
                    }
                };
                Some(Host {
                    id: r.id.into(),
                    country,
                    country_name: r.country_name,
                    address: r.address,
                    load: r.load,
                    refreshed_at: now,
                })
            })
            .collect();
        Ok(hosts)
    }

    async fn current_ip(&self) -> Result<String, DirectoryError> {
        let text = self
            .get("user/address")
            .await?
            .text()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(text.trim().to_string())
    }
}

struct CachedHosts {
    hosts: Vec<Host>,
    fetched_at: Instant,
}

/// TTL-cached view of the directory with load-based ranking
pub struct HostDirectory {
    api: Arc<dyn DirectoryApi>,
    config: DirectoryConfig,
    cache: Mutex<Option<CachedHosts>>,
}

impl HostDirectory {
    /// Wrap a directory API with the configured cache policy
    pub fn new(api: Arc<dyn DirectoryApi>, config: DirectoryConfig) -> Self {
        Self {
            api,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Fetch a fresh host list, replacing the cache wholesale
    pub async fn refresh(&self) -> Result<(), DirectoryError> {
        let hosts = self.fetch_with_retry().await?;
        let mut cache = self.cache.lock().await;
        *cache = Some(CachedHosts {
            hosts,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    /// Pick the best host for the given target.
    ///
    /// A stale or empty cache triggers a synchronous refresh first. If
    /// the refresh fails but stale data exists, ranking degrades to the
    /// stale data; with no cache at all the failure propagates.
    pub async fn rank(&self, target: &TargetSpec) -> Result<Host, DirectoryError> {
        let mut cache = self.cache.lock().await;

        let stale = match cache.as_ref() {
            None => true,
            Some(c) => c.fetched_at.elapsed() > self.config.cache_ttl,
        };

        if stale {
            match self.fetch_with_retry().await {
                Ok(hosts) => {
                    *cache = Some(CachedHosts {
                        hosts,
                        fetched_at: Instant::now(),
                    });
                }
                Err(err) => {
                    if cache.is_none() {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "directory refresh failed, ranking against stale cache");
                }
            }
        }

        let Some(cached) = cache.as_ref() else {
            return Err(DirectoryError::Unavailable("no cached hosts".to_string()));
        };

        match target {
            TargetSpec::Host(id) => cached
                .hosts
                .iter()
                .find(|h| &h.id == id)
                .cloned()
                .ok_or_else(|| DirectoryError::NoMatchingHost(id.to_string())),
            TargetSpec::Country(cc) => cached
                .hosts
                .iter()
                .filter(|h| &h.country == cc)
                .min_by(|a, b| {
                    // lowest load wins; ties go to the freshest record
                    a.load
                        .cmp(&b.load)
                        .then(b.refreshed_at.cmp(&a.refreshed_at))
                })
                .cloned()
                .ok_or_else(|| DirectoryError::NoMatchingHost(cc.to_string())),
        }
    }

    /// Our public IP address, straight from the service (uncached)
    pub async fn current_ip(&self) -> Result<String, DirectoryError> {
        self.api.current_ip().await
    }

    async fn fetch_with_retry(&self) -> Result<Vec<Host>, DirectoryError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.api.fetch_hosts().await {
                Ok(hosts) => return Ok(hosts),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "directory fetch failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| DirectoryError::Unavailable("no fetch attempted".to_string())))
    }
}
