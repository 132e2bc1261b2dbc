// # Account-header rule handlers

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::types::Ack;
use crate::api::{ApiError, ApiResult, ApiState};
use crate::proxy::rules::AccountHeaderRule;

pub async fn list(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<AccountHeaderRule>> {
    Ok(Json(state.rules.list()))
}

#[derive(Debug, Deserialize)]
pub struct RuleUpsert {
    pub url_prefix: String,
    pub headers: Vec<String>,
}

pub async fn upsert(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RuleUpsert>,
) -> ApiResult<AccountHeaderRule> {
    Ok(Json(state.rules.upsert(&req.url_prefix, req.headers).await?))
}

#[derive(Debug, Deserialize)]
pub struct RuleDelete {
    pub url_prefix: String,
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Query(req): Query<RuleDelete>,
) -> Result<Json<Ack>, ApiError> {
    state.rules.delete(&req.url_prefix).await?;
    Ok(Ack::ok())
}
