//! Admin HTTP API
//!
//! Read-only surface for operators and probes: health, convergence
//! counters, and the current server list as JSON.

use crate::common::types::ServiceMask;
use crate::coordinator::server_list::CoordinatorServerList;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct CoordState {
    pub list: Arc<CoordinatorServerList>,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/servers", get(servers))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<CoordState>) -> impl IntoResponse {
    axum::Json(state.list.stats())
}

async fn servers(State(state): State<CoordState>) -> impl IntoResponse {
    axum::Json(state.list.serialize(ServiceMask::ALL))
}
