use std::{sync::Arc, time::Duration};

use super::cache::{CacheEntry, CacheError, HttpCache, now_nanos};
use crate::error::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Classify for FetchError {
    fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Status { status: 404, .. } => ErrorKind::NotFound,
            _ => ErrorKind::IoFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub body: String,
    pub from_cache: bool,
}

/// What a `Cache-Control` header allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    NoStore,
    Forever,
    For(Duration),
}

/// Reads `immutable` and `max-age`; every other directive is ignored.
pub fn parse_cache_control(value: &str) -> CachePolicy {
    if value.is_empty() {
        return CachePolicy::NoStore;
    }
    if value.contains("immutable") {
        return CachePolicy::Forever;
    }
    let Some(start) = value.find("max-age=") else {
        return CachePolicy::NoStore;
    };
    let raw = value[start + "max-age=".len()..]
        .trim_start_matches('"')
        .split([',', '"'])
        .next()
        .unwrap_or_default()
        .trim();
    match raw.parse::<i64>() {
        Ok(secs) if secs > 0 => CachePolicy::For(Duration::from_secs(secs.unsigned_abs())),
        Ok(_) => CachePolicy::NoStore,
        Err(e) => {
            tracing::warn!(cache_control = value, error = %e, "unparseable max-age");
            CachePolicy::NoStore
        }
    }
}

/// Seconds the response already spent in upstream caches.
pub fn parse_age(value: &str) -> Duration {
    match value.trim().parse::<i64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
        _ => Duration::ZERO,
    }
}

/// HTTP client that answers from the cache when it can. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CacheClient {
    cache: Arc<HttpCache>,
    client: reqwest::Client,
}

impl CacheClient {
    pub fn new(cache: Arc<HttpCache>, client: reqwest::Client) -> Self {
        Self { cache, client }
    }

    pub fn cache(&self) -> &HttpCache {
        &self.cache
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size()
    }

    pub async fn save(&self) -> Result<(), CacheError> {
        self.cache.save().await
    }

    /// GETs `url`. Responses are stored when their `Cache-Control` allows;
    /// a cached non-200 status is replayed as an error.
    pub async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        if let Some(entry) = self.cache.get(url) {
            if entry.status_code != 200 {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: entry.status_code,
                });
            }
            return Ok(FetchResponse {
                body: entry.value,
                from_cache: true,
            });
        }

        tracing::debug!(url, "http fetch");
        let started = std::time::Instant::now();
        let request_err = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(request_err)?;
        let status = resp.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let cache_control = header(reqwest::header::CACHE_CONTROL);
        let age = header(reqwest::header::AGE);
        let body = resp.text().await.map_err(request_err)?;

        let elapsed = started.elapsed();
        if elapsed >= Duration::from_millis(50) {
            tracing::debug!(url, elapsed_ms = elapsed.as_millis() as u64, "slow http fetch");
        }

        let deadline = match parse_cache_control(&cache_control) {
            CachePolicy::NoStore => {
                tracing::debug!(url, cache_control = %cache_control, "response is not cacheable");
                None
            }
            CachePolicy::Forever => Some(None),
            CachePolicy::For(max_age) => {
                let ttl = max_age.as_nanos() as i64 - parse_age(&age).as_nanos() as i64;
                Some(Some(now_nanos().saturating_add(ttl)))
            }
        };
        if let Some(deadline) = deadline {
            self.cache.set(
                url,
                CacheEntry {
                    status_code: status,
                    value: body.clone(),
                    deadline,
                    last_used: 0,
                },
            );
        }

        if status != 200 {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(FetchResponse {
            body,
            from_cache: false,
        })
    }

    /// Whether `url` exists. Answers from the cache without a request when
    /// a copy is stored; HEAD responses are never cached.
    pub async fn head(&self, url: &str) -> Result<bool, FetchError> {
        if self.cache.get(url).is_some() {
            return Ok(true);
        }
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }
}
