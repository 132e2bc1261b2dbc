// # Subscription handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::types::Ack;
use crate::api::{ApiError, ApiResult, ApiState};
use crate::subscription::manager::SubscriptionPatch;
use crate::subscription::Subscription;

#[derive(Debug, Deserialize)]
pub struct SubscriptionCreate {
    pub name: String,
    pub url: String,
    pub update_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ephemeral: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: String,
    pub name: String,
    pub url: String,
    pub update_interval_secs: u64,
    pub enabled: bool,
    pub ephemeral: bool,
    pub managed_nodes: usize,
    pub evicted_nodes: usize,
    pub last_refresh_at_ns: i64,
    pub last_refresh_error: String,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
}

impl From<Subscription> for SubscriptionView {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            name: s.name,
            url: s.url,
            update_interval_secs: (s.update_interval_ns / 1_000_000_000) as u64,
            enabled: s.enabled,
            ephemeral: s.ephemeral,
            managed_nodes: s.managed.len(),
            evicted_nodes: s.managed.values().filter(|m| m.evicted).count(),
            last_refresh_at_ns: s.last_refresh_at_ns,
            last_refresh_error: s.last_refresh_error,
            created_at_ns: s.created_at_ns,
            updated_at_ns: s.updated_at_ns,
        }
    }
}

pub async fn list(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<SubscriptionView>> {
    let mut out: Vec<SubscriptionView> = state
        .subscriptions
        .list()
        .into_iter()
        .map(Into::into)
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(out))
}

pub async fn create(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SubscriptionCreate>,
) -> ApiResult<SubscriptionView> {
    let sub = state
        .subscriptions
        .create(
            &req.name,
            &req.url,
            req.update_interval_secs,
            req.enabled,
            req.ephemeral,
        )
        .await?;
    // A new subscription is useful once fetched; kick a refresh off now.
    let scheduler = state.scheduler.clone();
    let id = sub.id.clone();
    tokio::spawn(async move {
        let _ = scheduler.refresh_now(&id).await;
    });
    Ok(Json(sub.into()))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<SubscriptionView> {
    let sub = state
        .subscriptions
        .get(&id)
        .ok_or_else(|| crate::error::ResinError::NotFound(format!("subscription {id}")))?;
    Ok(Json(sub.into()))
}

pub async fn patch(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<SubscriptionPatch>,
) -> ApiResult<SubscriptionView> {
    Ok(Json(state.subscriptions.patch(&id, req).await?.into()))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.subscriptions.delete(&id).await?;
    Ok(Ack::ok())
}

pub async fn refresh(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<SubscriptionView> {
    state.scheduler.refresh_now(&id).await?;
    let sub = state
        .subscriptions
        .get(&id)
        .ok_or_else(|| crate::error::ResinError::NotFound(format!("subscription {id}")))?;
    Ok(Json(sub.into()))
}

#[derive(Debug, Serialize)]
pub struct CleanupResult {
    pub evicted: usize,
}

pub async fn cleanup_unhealthy(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CleanupResult> {
    let evicted = state.subscriptions.cleanup_unhealthy(&id)?;
    Ok(Json(CleanupResult { evicted }))
}
