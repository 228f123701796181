//! HTTP health endpoints
//!
//! - `/health/live`: liveness of the local data node
//! - `/health/ready`: readiness of the local node (and its master, when set)
//! - `/metrics`: Prometheus text format

use crate::common::{timestamp_now, NodeAddr, METRICS};
use crate::probe::{check, check_with_master, ProbeKind, ProbeOutcome};
use crate::protocol::DataPlane;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HealthState {
    pub data_plane: Arc<dyn DataPlane>,
    pub local: NodeAddr,
    /// Also probe the master for replicas
    pub master: Option<NodeAddr>,
    pub timeout: Duration,
}

impl HealthState {
    async fn probe(&self, kind: ProbeKind) -> ProbeOutcome {
        match &self.master {
            Some(master) if *master != self.local => {
                check_with_master(self.data_plane.as_ref(), &self.local, master, kind, self.timeout)
                    .await
            }
            _ => check(self.data_plane.as_ref(), &self.local, kind, self.timeout).await,
        }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn respond(kind: ProbeKind, outcome: ProbeOutcome) -> impl IntoResponse {
    let status = if outcome.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        axum::Json(json!({
            "probe": kind,
            "healthy": outcome.healthy,
            "detail": outcome.detail,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": timestamp_now(),
        })),
    )
}

async fn health_live(State(state): State<HealthState>) -> impl IntoResponse {
    respond(ProbeKind::Liveness, state.probe(ProbeKind::Liveness).await)
}

async fn health_ready(State(state): State<HealthState>) -> impl IntoResponse {
    respond(ProbeKind::Readiness, state.probe(ProbeKind::Readiness).await)
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}
