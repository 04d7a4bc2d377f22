//! Request timing middleware

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info};

/// Log how long each request took; branch lookups at `debug` so the hot path
/// stays quiet at the default level
pub async fn timing_layer(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let elapsed_us = start.elapsed().as_micros();
    let status = response.status().as_u16();
    if path == "/branch" || path == "/health" {
        debug!("{} {} -> {} in {}us", method, path, status, elapsed_us);
    } else {
        info!("{} {} -> {} in {}us", method, path, status, elapsed_us);
    }

    response
}
