// # Lease handlers

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::types::Ack;
use crate::api::{ApiError, ApiResult, ApiState};
use crate::error::ResinError;
use crate::router::Lease;

#[derive(Debug, Deserialize)]
pub struct LeaseQuery {
    pub platform_id: Option<String>,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LeaseQuery>,
) -> ApiResult<Vec<Lease>> {
    let mut out = state.router.list_leases(query.platform_id.as_deref());
    out.sort_by(|a, b| {
        (&a.platform_id, &a.account).cmp(&(&b.platform_id, &b.account))
    });
    Ok(Json(out))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path((platform_id, account)): Path<(String, String)>,
) -> ApiResult<Lease> {
    let lease = state
        .router
        .get_lease(&platform_id, &account)
        .ok_or_else(|| ResinError::NotFound(format!("lease {platform_id}/{account}")))?;
    Ok(Json(lease))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path((platform_id, account)): Path<(String, String)>,
) -> Result<Json<Ack>, ApiError> {
    state.router.delete_lease(&platform_id, &account)?;
    Ok(Ack::ok())
}
