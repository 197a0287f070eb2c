//! Request middleware: security headers, per-IP rate limiting and access logs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{ServiceRequest, ServiceResponse},
    http::header::{self, HeaderName, HeaderValue},
    middleware::Next,
    web, Error, HttpRequest, ResponseError,
};

use crate::config::Settings;
use crate::error::ApiError;

const WINDOW: Duration = Duration::from_secs(60);

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; connect-src 'self' https:; font-src 'self' data:; object-src 'none'; media-src 'self'; frame-src 'none';";

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
    ("content-security-policy", CONTENT_SECURITY_POLICY),
    ("strict-transport-security", "max-age=31536000; includeSubDomains; preload"),
];

/// The socket peer address. Forwarded headers are ignored since any client
/// can set them.
pub fn client_ip(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn security_headers(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let mut response = next.call(req).await?;
    let headers = response.headers_mut();
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    Ok(response)
}

/// Sliding-window request counter keyed by client IP.
///
/// Paths under `/auth/` are counted against the stricter auth limit in a
/// separate bucket.
#[derive(Debug)]
pub struct RateLimiter {
    general_limit: usize,
    auth_limit: usize,
    general: Mutex<HashMap<String, VecDeque<Instant>>>,
    auth: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(general_limit: usize, auth_limit: usize) -> Self {
        RateLimiter {
            general_limit,
            auth_limit,
            general: Mutex::new(HashMap::new()),
            auth: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.rate_limit_per_minute, settings.auth_rate_limit_per_minute)
    }

    pub fn is_exempt(path: &str) -> bool {
        matches!(path, "/" | "/health")
    }

    pub fn check(&self, ip: &str, path: &str) -> bool {
        self.check_at(ip, path, Instant::now())
    }

    /// Records one request at `now` and reports whether it is allowed.
    pub fn check_at(&self, ip: &str, path: &str, now: Instant) -> bool {
        if Self::is_exempt(path) {
            return true;
        }

        let (buckets, limit) = if path.starts_with("/auth/") {
            (&self.auth, self.auth_limit)
        } else {
            (&self.general, self.general_limit)
        };

        let mut buckets = buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let hits = buckets.entry(ip.to_string()).or_default();
        while hits.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
            hits.pop_front();
        }

        if hits.len() >= limit {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drops clients with no requests inside the window.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for buckets in [&self.general, &self.auth] {
            let mut buckets = buckets.lock().unwrap_or_else(PoisonError::into_inner);
            let before = buckets.len();
            buckets.retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < WINDOW));
            removed += before - buckets.len();
        }
        removed
    }
}

pub async fn rate_limit<B: MessageBody + 'static>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    if let Some(limiter) = req.app_data::<web::Data<RateLimiter>>() {
        let ip = client_ip(req.request());
        if !limiter.check(&ip, req.path()) {
            tracing::warn!(client_ip = %ip, path = %req.path(), "Rate limit exceeded");
            let response = ApiError::RateLimited.error_response();
            return Ok(req.into_response(response));
        }
    }
    next.call(req).await.map(ServiceResponse::map_into_boxed_body)
}

pub async fn request_log(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req.path().to_string();
    let ip = client_ip(req.request());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let response = next.call(req).await?;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match status {
        401 => tracing::warn!(%method, %path, client_ip = %ip, %user_agent, status, elapsed_ms, "Unauthorized request"),
        500..=599 => tracing::error!(%method, %path, client_ip = %ip, %user_agent, status, elapsed_ms, "Request failed"),
        _ => tracing::info!(%method, %path, client_ip = %ip, %user_agent, status, elapsed_ms, "Request"),
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{middleware::from_fn, test, App, HttpResponse};

    #[::core::prelude::v1::test]
    fn general_limit_applies_per_ip() {
        let limiter = RateLimiter::new(3, 1);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at("10.0.0.1", "/records/x", now));
        }
        assert!(!limiter.check_at("10.0.0.1", "/records/x", now));
        assert!(limiter.check_at("10.0.0.2", "/records/x", now));
    }

    #[::core::prelude::v1::test]
    fn auth_paths_have_their_own_quota() {
        let limiter = RateLimiter::new(100, 2);
        let now = Instant::now();
        assert!(limiter.check_at("ip", "/auth/login", now));
        assert!(limiter.check_at("ip", "/auth/login", now));
        assert!(!limiter.check_at("ip", "/auth/register", now));
        assert!(limiter.check_at("ip", "/dashboard/stats", now));
    }

    #[::core::prelude::v1::test]
    fn window_slides() {
        let limiter = RateLimiter::new(1, 1);
        let start = Instant::now();
        assert!(limiter.check_at("ip", "/models/", start));
        assert!(!limiter.check_at("ip", "/models/", start + Duration::from_secs(30)));
        assert!(limiter.check_at("ip", "/models/", start + Duration::from_secs(61)));
    }

    #[::core::prelude::v1::test]
    fn root_and_health_are_exempt() {
        let limiter = RateLimiter::new(0, 0);
        assert!(limiter.check("ip", "/"));
        assert!(limiter.check("ip", "/health"));
        assert!(!limiter.check("ip", "/healthz"));
    }

    #[::core::prelude::v1::test]
    fn purge_keeps_active_clients() {
        let limiter = RateLimiter::new(10, 10);
        limiter.check("active", "/records");
        limiter.check_at("stale", "/records", Instant::now() - Duration::from_secs(120));
        assert_eq!(limiter.purge_idle(), 1);
        assert!(limiter.general.lock().unwrap().contains_key("active"));
    }

    #[actix_web::test]
    async fn headers_are_added() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(security_headers))
                .route("/", web::get().to(HttpResponse::Ok)),
        )
        .await;
        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(res.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert!(res
            .headers()
            .get("strict-transport-security")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("preload"));
    }

    #[actix_web::test]
    async fn over_limit_gets_429() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(RateLimiter::new(1, 1)))
                .wrap(from_fn(rate_limit))
                .route("/ping", web::get().to(HttpResponse::Ok)),
        )
        .await;
        let first = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request()).await;
        assert!(first.status().is_success());
        let second = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request()).await;
        assert_eq!(second.status(), 429);
        assert_eq!(second.headers().get("retry-after").unwrap(), "60");
    }
}
