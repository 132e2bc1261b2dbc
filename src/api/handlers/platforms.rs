// # Platform handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::api::types::Ack;
use crate::api::{ApiError, ApiResult, ApiState};
use crate::platform::{Platform, PlatformCreate, PlatformPatch, PlatformSpec};

/// Platform plus its derived view size.
#[derive(Debug, Serialize)]
pub struct PlatformView {
    #[serde(flatten)]
    pub spec: PlatformSpec,
    pub view_size: usize,
}

impl PlatformView {
    fn of(platform: &Platform) -> Self {
        Self {
            spec: platform.spec(),
            view_size: platform.view_len(),
        }
    }
}

pub async fn list(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<PlatformView>> {
    let mut out: Vec<PlatformView> = state
        .platforms
        .list()
        .iter()
        .map(|p| PlatformView::of(p))
        .collect();
    out.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
    Ok(Json(out))
}

pub async fn create(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PlatformCreate>,
) -> ApiResult<PlatformView> {
    let spec = state.platforms.create(req).await?;
    let platform = state
        .platforms
        .get(&spec.id)
        .ok_or_else(|| crate::error::ResinError::Internal("platform vanished".into()))?;
    Ok(Json(PlatformView::of(&platform)))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<PlatformView> {
    let platform = state
        .platforms
        .get(&id)
        .ok_or_else(|| crate::error::ResinError::NotFound(format!("platform {id}")))?;
    Ok(Json(PlatformView::of(&platform)))
}

pub async fn patch(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<PlatformPatch>,
) -> ApiResult<PlatformSpec> {
    Ok(Json(state.platforms.patch(&id, req).await?))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.platforms.delete(&id).await?;
    Ok(Ack::ok())
}

pub async fn reset(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<PlatformSpec> {
    Ok(Json(state.platforms.reset(&id).await?))
}

pub async fn rebuild_view(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.platforms.rebuild_view(&id)?;
    Ok(Ack::ok())
}
