//! Fixed-window request rate limiting keyed by client address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::api::routes::AppState;
use crate::config::RateLimitConfig;

struct Window {
    started: Instant,
    count: u32,
}

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    /// Denied; retry after this many milliseconds.
    Limited { retry_after_ms: u64 },
}

/// Fixed-window counter per client address. Window length and cap are
/// passed per call so configuration reloads apply immediately.
pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `addr` against the current window.
    pub fn check(&self, addr: IpAddr, config: &RateLimitConfig) -> Decision {
        if !config.enabled {
            return Decision::Allowed;
        }

        let window_len = Duration::from_millis(config.window_ms.max(1));
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();

        // Drop expired windows so the map does not grow with one entry
        // per client forever.
        windows.retain(|_, w| now.duration_since(w.started) < window_len);

        let window = windows.entry(addr).or_insert(Window {
            started: now,
            count: 0,
        });

        if window.count >= config.max_requests {
            let elapsed = now.duration_since(window.started);
            let retry_after_ms = window_len.saturating_sub(elapsed).as_millis() as u64;
            return Decision::Limited { retry_after_ms };
        }

        window.count += 1;
        Decision::Allowed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum middleware enforcing the limiter on `/api` routes.
pub async fn middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let config = state.config.read().await.rate_limit.clone();

    match state.rate_limiter.check(addr.ip(), &config) {
        Decision::Allowed => next.run(request).await,
        Decision::Limited { retry_after_ms } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": "Rate limit exceeded",
                "retryAfter": retry_after_ms,
            })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_requests: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_allows_within_cap() {
        let limiter = RateLimiter::new();
        let config = config(3, 60_000);
        for _ in 0..3 {
            assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
        }
    }

    #[test]
    fn test_rejects_over_cap_with_retry_hint() {
        let limiter = RateLimiter::new();
        let config = config(2, 60_000);
        assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
        assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);

        match limiter.check(ip(1), &config) {
            Decision::Limited { retry_after_ms } => assert!(retry_after_ms <= 60_000),
            Decision::Allowed => panic!("expected the third request to be limited"),
        }
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new();
        let config = config(1, 60_000);
        assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
        assert_eq!(limiter.check(ip(2), &config), Decision::Allowed);
        assert!(matches!(
            limiter.check(ip(1), &config),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let limiter = RateLimiter::new();
        let config = config(1, 30);
        assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
        assert!(matches!(
            limiter.check(ip(1), &config),
            Decision::Limited { .. }
        ));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            enabled: false,
            window_ms: 1,
            max_requests: 0,
        };
        for _ in 0..10 {
            assert_eq!(limiter.check(ip(1), &config), Decision::Allowed);
        }
    }
}
