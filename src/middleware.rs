//! Edge middleware: resized-prefix guard, CORS, and per-IP rate limiting.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde_json::json;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::errors::ServiceError;
use crate::routes::AppState;

/// GCRA limiter keyed by client IP.
pub type IpRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Build the per-IP limiter for `max` requests per `window`. `max == 0`
/// disables limiting.
pub fn build_rate_limiter(max: u32, window: Duration) -> Option<Arc<IpRateLimiter>> {
    let max = NonZeroU32::new(max)?;
    let period = window / max.get();
    let quota = Quota::with_period(period)?.allow_burst(max);
    Some(Arc::new(RateLimiter::keyed(quota)))
}

/// Refuse requests whose path points into the rendition bucket. Serving
/// them would loop the service through its own cache.
pub async fn forbid_resized_prefix(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(prefix) = &state.config.resized_image_path {
        if request.uri().path().starts_with(prefix.as_str()) {
            return ServiceError::Forbidden.into_response();
        }
    }
    next.run(request).await
}

/// Allow-list CORS: echo the origin when configured, answer preflights
/// directly.
pub async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let allowed = origin.as_deref().is_some_and(|origin| {
        state
            .config
            .allowed_origins
            .iter()
            .any(|allow| allow == origin || allow == "*")
    });

    if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        if allowed {
            apply_cors_headers(&mut response, origin.as_deref());
        }
        return response;
    }

    let mut response = next.run(request).await;
    if allowed {
        apply_cors_headers(&mut response, origin.as_deref());
    }
    response
}

fn apply_cors_headers(response: &mut Response, origin: Option<&str>) {
    let Some(origin) = origin else { return };
    let Ok(value) = HeaderValue::from_str(origin) else {
        return;
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("origin"));
}

/// Per-IP rate limit. Prefers `X-Forwarded-For` (first hop) so the limit
/// keys on the real client when the service sits behind a proxy.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = &state.limiter else {
        return next.run(request).await;
    };

    let client = client_ip(&request);
    if limiter.check_key(&client).is_err() {
        warn!(%client, "rate limit exceeded");
        let body = Json(json!({
            "error": "Too many requests",
            "status": StatusCode::TOO_MANY_REQUESTS.as_u16(),
        }));
        return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    }

    next.run(request).await
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
