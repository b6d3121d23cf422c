use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::app_state::AppState;
use super::rate_limit::{api_rate_limit, ws_rate_limit};
use super::{admin, ws_handler};

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Any origin for local development, otherwise only the configured public URL.
    let public_url = &state.config.server.public_url;
    let cors = if public_url.contains("localhost") || public_url.contains("127.0.0.1") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origin = public_url
            .parse::<HeaderValue>()
            .unwrap_or_else(|_| HeaderValue::from_static("https://localhost"));
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let rate_limiters = state.rate_limiters.clone();

    let ws_routes = Router::new()
        .route("/ws/{room}", axum::routing::get(ws_handler::ws_upgrade))
        .layer(axum::middleware::from_fn(ws_rate_limit));

    let api_routes = Router::new()
        .route(
            "/api/chat/ban/{room}/{user}",
            axum::routing::post(admin::ban_user),
        )
        .route(
            "/api/chat/rooms/{room}",
            axum::routing::get(admin::room_occupancy),
        )
        .layer(axum::middleware::from_fn(api_rate_limit));

    Router::new()
        .route("/api/health", axum::routing::get(admin::health))
        .merge(ws_routes)
        .merge(api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Inject rate limiters into all request extensions
        .layer(axum::Extension(rate_limiters))
        .with_state(state)
}
