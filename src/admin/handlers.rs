use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::admin::ControlState;
use crate::lifecycle::context::GenerationState;
use crate::lifecycle::signals::{ControlSignal, Delivery};
use crate::store::MirrorState;

#[derive(Serialize)]
pub struct GenerationReport {
    pub id: Uuid,
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub started_at: u64,
    pub state: GenerationState,
}

#[derive(Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub generation: Option<GenerationReport>,
    pub listener: Option<String>,
    pub active_connections: u64,
    pub mirrors: usize,
}

pub async fn get_status(State(state): State<Arc<ControlState>>) -> Json<StatusReport> {
    let generation = state.generation.load_full().map(|g| GenerationReport {
        id: g.id,
        pid: g.pid,
        parent_pid: g.parent_pid,
        started_at: g.started_at,
        state: g.state(),
    });
    let server = state.server.load_full();

    Json(StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        generation,
        listener: server.as_ref().and_then(|s| s.local_addr()).map(|a| a.to_string()),
        active_connections: server.as_ref().map_or(0, |s| s.active_connections()),
        mirrors: state.store.load_full().map_or(0, |s| s.len()),
    })
}

pub async fn get_mirrors(State(state): State<Arc<ControlState>>) -> Json<Vec<MirrorState>> {
    Json(state.store.load_full().map(|s| s.snapshot()).unwrap_or_default())
}

/// Inject a control signal into the dispatcher queue.
pub async fn post_signal(State(state): State<Arc<ControlState>>, Path(name): Path<String>) -> Response {
    let Some(signal) = ControlSignal::from_name(&name) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown signal '{}'", name) }))).into_response();
    };

    tracing::info!(signal = signal.name(), "Signal requested over control channel");
    let (status, delivery) = match state.signals.send(signal).await {
        Delivery::Queued => (StatusCode::ACCEPTED, "queued"),
        Delivery::Coalesced => (StatusCode::ACCEPTED, "coalesced"),
        Delivery::Dropped => (StatusCode::SERVICE_UNAVAILABLE, "dropped"),
    };
    (status, Json(json!({ "signal": signal.name(), "delivery": delivery }))).into_response()
}
