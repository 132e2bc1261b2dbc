// # System handlers

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::api::{ApiResult, ApiState};
use crate::config::RuntimeConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_time: &'static str,
    pub started_at: String,
}

pub async fn root() -> &'static str {
    concat!("resin ", env!("CARGO_PKG_VERSION"), "\n")
}

pub async fn healthz() -> &'static str {
    "ok\n"
}

pub async fn get_info(State(state): State<Arc<ApiState>>) -> ApiResult<SystemInfo> {
    Ok(Json(SystemInfo {
        version: VERSION,
        git_commit: option_env!("RESIN_GIT_COMMIT").unwrap_or("unknown"),
        build_time: option_env!("RESIN_BUILD_TIME").unwrap_or("unknown"),
        started_at: state.started_at.to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ConfigEnvelope {
    pub version: u64,
    pub config: RuntimeConfig,
}

pub async fn get_config(State(state): State<Arc<ApiState>>) -> ApiResult<ConfigEnvelope> {
    Ok(Json(ConfigEnvelope {
        version: state.config.version(),
        config: (*state.config.get()).clone(),
    }))
}

pub async fn patch_config(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<Value>,
) -> ApiResult<ConfigEnvelope> {
    let published = state.config.patch(patch).await?;
    Ok(Json(ConfigEnvelope {
        version: state.config.version(),
        config: (*published).clone(),
    }))
}
