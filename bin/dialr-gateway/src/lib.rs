//! Dialr Gateway - HTTP surface of the branch resolution engine

pub mod error;
pub mod handlers;
pub mod timing;

use axum::{Router, middleware, routing::get};
use dialr_engine::Engine;
use handlers::GatewayState;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the gateway router
pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(GatewayState { engine });
    Router::new()
        .route("/branch", get(handlers::get_branch))
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(timing::timing_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
