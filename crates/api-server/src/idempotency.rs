//! `Idempotency-Key` support for mutating endpoints.
//!
//! The first response for a key is buffered and replayed verbatim for any
//! repeat of the same method, path and key within the TTL. Server errors are
//! never cached so a client can retry them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use outreach_core::config::IdempotencyConfig;
use tracing::{debug, warn};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "idempotent-replayed";

/// Largest response body kept for replay.
const MAX_CACHED_BODY: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct CachedResponse {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct IdempotencyCache {
    entries: DashMap<String, CachedResponse>,
    ttl: Duration,
    max_entries: usize,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let hit = self.entries.get(key).map(|e| e.clone())?;
        if hit.stored_at.elapsed() > self.ttl {
            self.entries.remove(key);
            return None;
        }
        Some(hit)
    }

    fn store(&self, key: String, response: CachedResponse) {
        if self.entries.len() >= self.max_entries {
            self.evict();
        }
        self.entries.insert(key, response);
    }

    /// Drop expired entries, then the oldest tenth if still full.
    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        if self.entries.len() < self.max_entries {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.stored_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let drop = (self.max_entries / 10).max(1);
        for (key, _) in by_age.into_iter().take(drop) {
            self.entries.remove(&key);
        }
        debug!(dropped = drop, "Idempotency cache evicted oldest entries");
    }

    /// Remove entries older than the TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        before.saturating_sub(self.entries.len())
    }
}

/// Middleware: replay or record responses for requests carrying an
/// `Idempotency-Key` header. Requests without one pass straight through.
pub async fn idempotent(
    State(cache): State<Arc<IdempotencyCache>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::GET {
        return next.run(request).await;
    }
    let Some(key) = request
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| format!("{} {} {}", request.method(), request.uri().path(), k))
    else {
        return next.run(request).await;
    };

    if let Some(hit) = cache.lookup(&key) {
        metrics::counter!("api.idempotent_replays").increment(1);
        debug!(key = %key, status = hit.status.as_u16(), "Replaying idempotent response");
        return replay(hit);
    }

    let response = next.run(request).await;
    if response.status().is_server_error() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %key, error = %e, "Response too large to cache for idempotency");
            return (StatusCode::INTERNAL_SERVER_ERROR, "response body unavailable").into_response();
        }
    };
    cache.store(
        key,
        CachedResponse {
            status: parts.status,
            content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
            body: bytes.clone(),
            stored_at: Instant::now(),
        },
    );
    Response::from_parts(parts, Body::from(bytes))
}

fn replay(hit: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(hit.body));
    *response.status_mut() = hit.status;
    if let Some(content_type) = hit.content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response
        .headers_mut()
        .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(status: StatusCode) -> CachedResponse {
        CachedResponse {
            status,
            content_type: None,
            body: Bytes::from_static(b"{}"),
            stored_at: Instant::now(),
        }
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = IdempotencyCache::new(Duration::from_millis(0), 10);
        cache.store("k".into(), cached(StatusCode::CREATED));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.lookup("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_full_cache_evicts_oldest() {
        let cache = IdempotencyCache::new(Duration::from_secs(60), 10);
        for i in 0..10u64 {
            let mut entry = cached(StatusCode::OK);
            entry.stored_at -= Duration::from_secs(20 - i);
            cache.store(format!("k{i}"), entry);
        }
        cache.store("k10".into(), cached(StatusCode::OK));
        assert_eq!(cache.len(), 10);
        assert!(cache.lookup("k0").is_none());
        assert!(cache.lookup("k10").is_some());
    }
}
