use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::rate_limiter::RateLimiter;

/// How often idle buckets are swept.
pub const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// A bucket untouched this long has refilled completely, so forgetting it changes nothing.
pub const STALE_BUCKET_AGE: Duration = Duration::from_secs(5 * 60);

/// Per-IP rate limiters for the two endpoint tiers.
pub struct ApiRateLimiters {
    /// HTTP API endpoints. Burst of 60, refill 1 per second.
    pub api: RateLimiter,
    /// WebSocket upgrades, against connection storms. Burst of 5, refill 1 per 12 seconds.
    pub ws: RateLimiter,
}

impl Default for ApiRateLimiters {
    fn default() -> Self {
        Self {
            api: RateLimiter::new(60, 1.0),
            ws: RateLimiter::new(5, 12.0),
        }
    }
}

impl ApiRateLimiters {
    /// Drop buckets of clients not seen for `older_than` from both tiers.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        self.api.cleanup(older_than) + self.ws.cleanup(older_than)
    }

    /// Sweep stale buckets every `period` until cancelled.
    pub async fn run_cleanup(&self, period: Duration, older_than: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.cleanup(older_than);
                    if dropped > 0 {
                        debug!(dropped, "stale rate limit buckets dropped");
                    }
                }
            }
        }
        info!("rate limit cleanup stopped");
    }
}

/// Client IP for rate limiting. Proxy headers are trusted only when the direct
/// peer is loopback (a local reverse proxy); otherwise the peer address is used
/// so a spoofed header cannot dodge the limit.
fn client_ip(req: &Request<Body>) -> String {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip());
    let from_loopback = peer_ip.is_some_and(|ip| ip.is_loopback());

    if from_loopback {
        if let Some(forwarded) = req.headers().get("x-forwarded-for")
            && let Ok(val) = forwarded.to_str()
            && let Some(first) = val.split(',').next()
        {
            return first.trim().to_string();
        }

        if let Some(real_ip) = req.headers().get("x-real-ip")
            && let Ok(val) = real_ip.to_str()
        {
            return val.trim().to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn limited(
    req: Request<Body>,
    next: Next,
    pick: fn(&ApiRateLimiters) -> &RateLimiter,
    message: &'static str,
) -> Response {
    if let Some(limiters) = req.extensions().get::<Arc<ApiRateLimiters>>() {
        let ip = client_ip(&req);
        if !pick(limiters).check(&ip) {
            return (StatusCode::TOO_MANY_REQUESTS, message).into_response();
        }
    }
    next.run(req).await
}

fn api_limiter(limiters: &ApiRateLimiters) -> &RateLimiter {
    &limiters.api
}

fn ws_limiter(limiters: &ApiRateLimiters) -> &RateLimiter {
    &limiters.ws
}

/// Middleware for general API rate limiting.
pub async fn api_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(req, next, api_limiter, "Rate limit exceeded. Please try again later.").await
}

/// Middleware for WebSocket upgrade rate limiting.
pub async fn ws_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(req, next, ws_limiter, "Too many connections. Please try again later.").await
}
