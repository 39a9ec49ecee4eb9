//! Service-registry client.
//!
//! The registry maps a city to the base URL of the operator that owns it.
//! Operators register themselves at boot and resolve remote participants
//! during the PREPARE phase. Lookups are cached briefly; any transport error
//! invalidates the cached entry so endpoint migration is tolerated.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CgridError, CgridResult};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    city: &'a str,
    api_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    found: bool,
    #[serde(default)]
    api_url: String,
}

struct CacheEntry {
    api_url: String,
    resolved_at: Instant,
}

/// HTTP client for the service registry.
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> CgridResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| CgridError::Registry(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
        })
    }

    #[cfg(test)]
    fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Announce this operator as the owner of `city`.
    pub async fn register(&self, name: &str, city: &str, api_url: &str) -> CgridResult<()> {
        let body = RegisterRequest {
            name,
            city,
            api_url,
        };
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CgridError::Registry(format!("register: {e}")))?;

        if !response.status().is_success() {
            return Err(CgridError::Registry(format!(
                "register rejected with status {}",
                response.status()
            )));
        }
        info!("registered {name} as operator of {city} at {api_url}");
        Ok(())
    }

    /// Resolve the operator endpoint for `city`. `Ok(None)` means no
    /// operator is registered there.
    pub async fn discover(&self, city: &str) -> CgridResult<Option<String>> {
        if let Some(cached) = self.cache_lookup(city) {
            debug!("registry cache hit for {city}");
            return Ok(Some(cached));
        }

        let response = self
            .http
            .get(format!("{}/discover", self.base_url))
            .query(&[("city", city)])
            .send()
            .await
            .map_err(|e| CgridError::Registry(format!("discover {city}: {e}")))?;

        if !response.status().is_success() {
            return Err(CgridError::Registry(format!(
                "discover {city} failed with status {}",
                response.status()
            )));
        }

        let body: DiscoverResponse = response
            .json()
            .await
            .map_err(|e| CgridError::Registry(format!("discover {city}: {e}")))?;

        if !body.found || body.api_url.is_empty() {
            warn!("no operator registered for city {city}");
            return Ok(None);
        }

        self.cache_store(city, &body.api_url);
        Ok(Some(body.api_url))
    }

    /// Drop the cached endpoint of `city`, forcing the next discover to hit
    /// the registry again. Called after any transport error against the
    /// resolved endpoint.
    pub fn invalidate(&self, city: &str) {
        self.cache.lock().remove(city);
    }

    fn cache_lookup(&self, city: &str) -> Option<String> {
        let cache = self.cache.lock();
        let entry = cache.get(city)?;
        if entry.resolved_at.elapsed() < self.cache_ttl {
            Some(entry.api_url.clone())
        } else {
            None
        }
    }

    fn cache_store(&self, city: &str, api_url: &str) {
        self.cache.lock().insert(
            city.to_string(),
            CacheEntry {
                api_url: api_url.to_string(),
                resolved_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip_and_invalidation() {
        let client = RegistryClient::new("http://registry:9000").unwrap();

        assert!(client.cache_lookup("Salvador").is_none());
        client.cache_store("Salvador", "http://op1:8080");
        assert_eq!(
            client.cache_lookup("Salvador").as_deref(),
            Some("http://op1:8080")
        );

        client.invalidate("Salvador");
        assert!(client.cache_lookup("Salvador").is_none());
    }

    #[test]
    fn cache_entries_expire() {
        let client = RegistryClient::new("http://registry:9000")
            .unwrap()
            .with_cache_ttl(Duration::from_millis(0));

        client.cache_store("Salvador", "http://op1:8080");
        assert!(client.cache_lookup("Salvador").is_none());
    }

    #[test]
    fn base_url_is_normalized() {
        let client = RegistryClient::new("http://registry:9000/").unwrap();
        assert_eq!(client.base_url, "http://registry:9000");
    }
}
