//! Fixed-window rate limiting.
//!
//! Counters live in the store, keyed by `(scope, tenant, identifier)`
//! and the window bucket. When the store is unreachable the limiter
//! degrades to a per-process map rather than failing open entirely;
//! the map is swept periodically so dead buckets do not accumulate.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::OAuthError;
use crate::state::AppState;
use crate::storage::SharedGateway;

/// Single-tenant deployments bucket everything under one tenant.
const DEFAULT_TENANT: &str = "default";

/// Per-(scope, tenant, identifier) fixed-window counter.
pub struct RateLimiter {
    gateway: SharedGateway,
    fallback: DashMap<(String, i64), i64>,
    window_ms: u64,
    max_requests: i64,
}

impl RateLimiter {
    pub fn new(gateway: SharedGateway, window_ms: u64, max_requests: i64) -> Self {
        Self {
            gateway,
            fallback: DashMap::new(),
            window_ms: window_ms.max(1),
            max_requests,
        }
    }

    /// Check and count a request.
    ///
    /// `Err(retry_after_secs)` when the window is exhausted.
    pub async fn check(&self, scope: &str, tenant: &str, identifier: &str) -> Result<(), u64> {
        let now_ms = Utc::now().timestamp_millis();
        let bucket = now_ms / self.window_ms as i64;
        let key = format!("{scope}:{tenant}:{identifier}");

        // Counter rows outlive their window by one more so a late
        // read in the same window still sees them.
        let ttl = Duration::from_millis(self.window_ms * 2);
        let count = match self.gateway.increment(&key, bucket, ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "rate-limit store unavailable, using in-memory fallback");
                self.fallback_increment(&key, bucket)
            }
        };

        if count > self.max_requests {
            let window_end_ms = (bucket + 1) * self.window_ms as i64;
            let retry_after = ((window_end_ms - now_ms).max(0) as u64).div_ceil(1000).max(1);
            debug!(
                scope = scope,
                identifier = identifier,
                count = count,
                limit = self.max_requests,
                "rate limit exceeded"
            );
            return Err(retry_after);
        }
        Ok(())
    }

    fn fallback_increment(&self, key: &str, bucket: i64) -> i64 {
        let mut entry = self
            .fallback
            .entry((key.to_string(), bucket))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    /// Drop fallback counters from past windows.
    pub fn sweep_fallback(&self) {
        let current_bucket = Utc::now().timestamp_millis() / self.window_ms as i64;
        self.fallback.retain(|(_, bucket), _| *bucket >= current_bucket);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .finish()
    }
}

/// Rate-limit scope for a request path.
fn categorize_path(path: &str) -> &'static str {
    if path.starts_with("/login") {
        "login"
    } else if path == "/token" || path == "/introspect" || path == "/revoke" {
        "token"
    } else if path == "/authorize" || path.starts_with("/auth/") {
        "authorize"
    } else {
        "api"
    }
}

/// The client identifier for rate limiting: forwarded IP, then the
/// socket address.
fn client_identifier(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(ip) = value.split(',').next()
    {
        return ip.trim().to_string();
    }
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return value.to_string();
    }
    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware applying the limiter to every route.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let scope = categorize_path(request.uri().path());
    let identifier = client_identifier(request.headers(), addr);

    match state
        .rate_limiter()
        .check(scope, DEFAULT_TENANT, &identifier)
        .await
    {
        Ok(()) => next.run(request).await,
        Err(retry_after) => OAuthError::RateLimitExceeded { retry_after }.into_response(),
    }
}
