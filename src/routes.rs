//! Route table and shared handler state.
//!
//! ## Structure
//! - `GET    /health`: liveness probe
//! - `GET    /{imageId}`: redirect to a rendition (or the original while
//!   one is being produced); query: `w`, `h`, `format`, `force_resize`
//! - `DELETE /{imageId}`: remove variants; query: `w`, `h`, `format`
//!
//! Middleware, outermost first: resized-prefix guard, CORS, rate limit.

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::handlers::{delete_image, get_image, health};
use crate::middleware::{cors, forbid_resized_prefix, rate_limit, IpRateLimiter};
use crate::resolver::VariantResolver;

/// State shared by all handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    /// Read-path entry point.
    pub resolver: VariantResolver,
    /// Process configuration.
    pub config: Arc<AppConfig>,
    /// Per-IP limiter; `None` disables limiting.
    pub limiter: Option<Arc<IpRateLimiter>>,
}

/// Build the service router over the given state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{image_id}", get(get_image).delete(delete_image))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn_with_state(state.clone(), cors))
        .layer(from_fn_with_state(state.clone(), forbid_resized_prefix))
        .with_state(state)
}
