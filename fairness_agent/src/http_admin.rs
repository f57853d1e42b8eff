//! RPC + admin HTTP surface. `/rpc/*` routes are the `HttpMessageBus`
//! counterpart peers POST to (see `bus.rs`); `/fairness*` routes are
//! the operator-facing admin surface for listing and switching the
//! active fairness metric.

use crate::agent::FairnessAgent;
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Serialize)]
struct MetricSummary {
    name: String,
    description: String,
}

async fn list_metrics(State(agent): State<Arc<FairnessAgent>>) -> Json<Vec<MetricSummary>> {
    let metrics = agent
        .list_metrics()
        .await
        .into_iter()
        .map(|(name, description)| MetricSummary { name, description })
        .collect();
    Json(metrics)
}

#[derive(Deserialize)]
struct SetMetricAction {
    name: String,
}

#[derive(Deserialize)]
struct FairnessAction {
    #[serde(rename = "set-metric")]
    set_metric: Option<SetMetricAction>,
}

#[derive(Serialize)]
struct StatusReply {
    status: String,
}

async fn dispatch_action(
    State(agent): State<Arc<FairnessAgent>>,
    Path(host): Path<String>,
    Json(action): Json<FairnessAction>,
) -> Json<StatusReply> {
    let Some(set_metric) = action.set_metric else {
        return Json(StatusReply {
            status: "Unsupported action.".to_string(),
        });
    };
    let status = agent.dispatch_set_metric(&host, &set_metric.name).await;
    Json(StatusReply { status })
}

#[derive(Deserialize)]
struct ReceiveHostSupplyBody {
    json_supply: String,
}

async fn rpc_receive_host_supply(
    State(agent): State<Arc<FairnessAgent>>,
    Json(body): Json<ReceiveHostSupplyBody>,
) -> Json<StatusReply> {
    match agent.receive_host_supply(&body.json_supply).await {
        Ok(()) => Json(StatusReply {
            status: "ok".to_string(),
        }),
        Err(e) => {
            log::warn!("receive_host_supply failed: {e}");
            Json(StatusReply {
                status: format!("error: {e}"),
            })
        }
    }
}

async fn rpc_receive_heavinesses(
    State(agent): State<Arc<FairnessAgent>>,
    Json(body): Json<crate::metrics::MetricResult>,
) -> Json<StatusReply> {
    match agent.receive_heavinesses(body).await {
        Ok(()) => Json(StatusReply {
            status: "ok".to_string(),
        }),
        Err(e) => {
            log::warn!("receive_heavinesses failed: {e}");
            Json(StatusReply {
                status: format!("error: {e}"),
            })
        }
    }
}

#[derive(Deserialize)]
struct SetMetricBody {
    metric_name: String,
}

async fn rpc_set_metric(
    State(agent): State<Arc<FairnessAgent>>,
    Json(body): Json<SetMetricBody>,
) -> Json<StatusReply> {
    let status = agent.set_metric(&body.metric_name).await;
    Json(StatusReply { status })
}

pub async fn serve(agent: Arc<FairnessAgent>, bind: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/fairness", get(list_metrics))
        .route("/fairness/{host}/action", post(dispatch_action))
        .route("/rpc/receive_host_supply", post(rpc_receive_host_supply))
        .route("/rpc/receive_heavinesses", post(rpc_receive_heavinesses))
        .route("/rpc/set_metric", post(rpc_set_metric))
        .with_state(agent);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind RPC/admin server to {bind}"))?;
    log::info!("RPC/admin surface listening on {bind}");
    axum::serve(listener, app)
        .await
        .context("RPC/admin server error")
}
