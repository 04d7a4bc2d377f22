//! Route handlers for the branch API.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use chrono::SecondsFormat;
use dialr_engine::{Engine, RequestContext, ResolveError, ResolveRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;

/// Header carrying the caller's access key
pub const ACCESS_KEY_HEADER: &str = "x-access-key";

/// Shared state for the gateway handlers
pub struct GatewayState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize)]
pub struct BranchResponse {
    pub branch: String,
    /// RFC 3339 expiry of the assignment
    pub expiry: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub watermark: String,
    pub access_keys: usize,
    pub experiments: usize,
    pub cached_assignments: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validate the raw inputs and build a resolution request. Query parameters
/// other than `uuid`, `rid` and `outcome` become filter context.
fn parse_request(
    headers: &HeaderMap,
    mut params: HashMap<String, String>,
) -> Result<ResolveRequest, ResolveError> {
    let access_key = non_empty(
        headers
            .get(ACCESS_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    )
    .ok_or(ResolveError::MissingAccessKey)?;
    let experiment_key =
        non_empty(params.remove("uuid")).ok_or(ResolveError::MissingExperimentKey)?;
    let request_id = non_empty(params.remove("rid")).ok_or(ResolveError::MissingRequestId)?;
    let outcome = non_empty(params.remove("outcome"));

    Ok(ResolveRequest {
        access_key,
        experiment_key,
        request_id,
        outcome,
        context: RequestContext { attributes: params },
    })
}

/// `GET /branch?uuid=<experiment key>&rid=<request id>[&outcome=<text>]`
pub async fn get_branch(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<BranchResponse>, ApiError> {
    let request = parse_request(&headers, params).inspect_err(|e| {
        debug!("Rejected branch request: {}", e);
    })?;

    match state.engine.resolve(&request).await {
        Ok(resolution) => Ok(Json(BranchResponse {
            branch: resolution.branch,
            expiry: resolution
                .expiry
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        })),
        Err(e) => {
            if e.is_client_error() {
                debug!("Branch request for {} failed: {}", request.experiment_key, e);
            }
            Err(e.into())
        }
    }
}

/// `GET /health`
pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let engine = &state.engine;
    Json(HealthResponse {
        status: "ok",
        watermark: engine.watermark().to_rfc3339(),
        access_keys: engine.state().access_key_count(),
        experiments: engine.state().experiment_count(),
        cached_assignments: engine.assignments().len(),
    })
}
