// # Node handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::types::Ack;
use crate::api::{ApiError, ApiResult, ApiState};
use crate::error::ResinError;
use crate::node::NodeSummary;
use crate::probe::ProbeKind;

pub async fn list(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<NodeSummary>> {
    let mut out = state.pool.snapshot();
    out.sort_by(|a, b| a.hash.cmp(&b.hash));
    Ok(Json(out))
}

#[derive(Debug, Serialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub summary: NodeSummary,
    pub latency: Vec<LatencyEntry>,
    pub last_egress_update_ns: i64,
    pub orphaned_at_ns: i64,
}

#[derive(Debug, Serialize)]
pub struct LatencyEntry {
    pub domain: String,
    pub ewma_ms: f64,
    pub last_updated_ns: i64,
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
) -> ApiResult<NodeDetail> {
    let entry = state
        .pool
        .get(&hash)
        .ok_or_else(|| ResinError::NotFound(format!("node {hash}")))?;
    let latency = entry
        .latency_snapshot()
        .into_iter()
        .map(|(domain, s)| LatencyEntry {
            domain,
            ewma_ms: s.ewma_ns as f64 / 1e6,
            last_updated_ns: s.last_updated_ns,
        })
        .collect();
    Ok(Json(NodeDetail {
        summary: entry.summary(),
        latency,
        last_egress_update_ns: entry.last_egress_update_ns(),
        orphaned_at_ns: entry.orphaned_at_ns(),
    }))
}

pub async fn probe(
    State(state): State<Arc<ApiState>>,
    Path((hash, kind)): Path<(String, String)>,
) -> Result<Json<Ack>, ApiError> {
    if state.pool.get(&hash).is_none() {
        return Err(ResinError::NotFound(format!("node {hash}")).into());
    }
    match kind.as_str() {
        "egress" => state.probes.trigger_immediate_egress(&hash),
        "latency" => {
            state.probes.enqueue(&hash, ProbeKind::Latency);
            state.probes.enqueue(&hash, ProbeKind::AuthorityLatency);
        }
        other => {
            return Err(
                ResinError::InvalidArgument(format!("unknown probe kind: {other}")).into(),
            )
        }
    }
    Ok(Ack::ok())
}

#[derive(Debug, Deserialize)]
pub struct CircuitRequest {
    pub open: bool,
}

pub async fn circuit(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
    Json(req): Json<CircuitRequest>,
) -> Result<Json<Ack>, ApiError> {
    state.pool.set_circuit(&hash, req.open)?;
    Ok(Ack::ok())
}
