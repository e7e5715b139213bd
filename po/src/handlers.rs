use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use flame_common::response;
use tokio::sync::watch;

use crate::cleanup;
use crate::compose::Orchestrator;
use crate::db;
use crate::hub;
use crate::models::{AnalysisStatus, CreateAnalysisRequest, StreamLogRequest, UpdateGeneration};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orch: Orchestrator,
    pub alive: watch::Receiver<bool>,
}

/// Liveness: 200 only while the supervisor's tasks are still running.
pub async fn health(State(state): State<AppState>) -> Response {
    if *state.alive.borrow() {
        Json(serde_json::json!({"status": "ok"})).into_response()
    } else {
        response::internal_server_error(anyhow::anyhow!("supervisor task is not alive"))
    }
}

/// Launch a new analysis generation.
pub async fn create_analysis(
    State(state): State<AppState>,
    Json(body): Json<CreateAnalysisRequest>,
) -> Response {
    match state.orch.launch(&body, 0).await {
        Ok(_) => Json(serde_json::json!({"status": AnalysisStatus::Started})).into_response(),
        Err(e) => response::internal_server_error(e.context("failed to launch analysis")),
    }
}

pub async fn retrieve_history_all(state: State<AppState>) -> Response {
    retrieve_history(state, None).await
}

pub async fn retrieve_history_one(
    state: State<AppState>,
    Path(analysis_id): Path<String>,
) -> Response {
    retrieve_history(state, Some(analysis_id)).await
}

async fn retrieve_history(
    State(state): State<AppState>,
    analysis_id: Option<String>,
) -> Response {
    match state.orch.retrieve_history(analysis_id.as_deref()).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => response::internal_server_error(e.context("failed to retrieve history")),
    }
}

pub async fn retrieve_logs_all(state: State<AppState>) -> Response {
    retrieve_logs(state, None).await
}

pub async fn retrieve_logs_one(
    state: State<AppState>,
    Path(analysis_id): Path<String>,
) -> Response {
    retrieve_logs(state, Some(analysis_id)).await
}

async fn retrieve_logs(State(state): State<AppState>, analysis_id: Option<String>) -> Response {
    match state.orch.retrieve_logs(analysis_id.as_deref()).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => response::internal_server_error(e.context("failed to retrieve logs")),
    }
}

pub async fn get_status_all(state: State<AppState>) -> Response {
    get_status(state, None).await
}

pub async fn get_status_one(state: State<AppState>, Path(analysis_id): Path<String>) -> Response {
    get_status(state, Some(analysis_id)).await
}

async fn get_status(State(state): State<AppState>, analysis_id: Option<String>) -> Response {
    match state.orch.get_status(analysis_id.as_deref()).await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => response::internal_server_error(e.context("failed to retrieve status")),
    }
}

pub async fn get_pods_all(state: State<AppState>) -> Response {
    get_pods(state, None).await
}

pub async fn get_pods_one(state: State<AppState>, Path(analysis_id): Path<String>) -> Response {
    get_pods(state, Some(analysis_id)).await
}

async fn get_pods(State(state): State<AppState>, analysis_id: Option<String>) -> Response {
    match state.orch.get_pods(analysis_id.as_deref()).await {
        Ok(pods) => Json(pods).into_response(),
        Err(e) => response::internal_server_error(e.context("failed to retrieve pods")),
    }
}

pub async fn stop_all(state: State<AppState>) -> Response {
    stop(state, None).await
}

pub async fn stop_one(state: State<AppState>, Path(analysis_id): Path<String>) -> Response {
    stop(state, Some(analysis_id)).await
}

async fn stop(State(state): State<AppState>, analysis_id: Option<String>) -> Response {
    let ids = match state.orch.analysis_ids(analysis_id.as_deref()).await {
        Ok(ids) => ids,
        Err(e) => return response::internal_server_error(e.context("failed to list analyses")),
    };
    let mut statuses: BTreeMap<String, AnalysisStatus> = BTreeMap::new();
    for id in ids {
        match state.orch.stop_analysis(&id).await {
            Ok(Some(status)) => {
                statuses.insert(id, status);
            }
            Ok(None) => {}
            Err(e) => {
                return response::internal_server_error(
                    e.context(format!("failed to stop analysis {}", id)),
                );
            }
        }
    }
    Json(statuses).into_response()
}

pub async fn delete_all(state: State<AppState>) -> Response {
    delete(state, None).await
}

pub async fn delete_one(state: State<AppState>, Path(analysis_id): Path<String>) -> Response {
    delete(state, Some(analysis_id)).await
}

async fn delete(State(state): State<AppState>, analysis_id: Option<String>) -> Response {
    let ids = match state.orch.analysis_ids(analysis_id.as_deref()).await {
        Ok(ids) => ids,
        Err(e) => return response::internal_server_error(e.context("failed to list analyses")),
    };
    let mut statuses: BTreeMap<String, AnalysisStatus> = BTreeMap::new();
    for id in ids {
        match state.orch.delete_analysis(&id).await {
            Ok(Some(status)) => {
                statuses.insert(id, status);
            }
            Ok(None) => {}
            Err(e) => {
                return response::internal_server_error(
                    e.context(format!("failed to delete analysis {}", id)),
                );
            }
        }
    }
    Json(statuses).into_response()
}

pub async fn run_cleanup(
    State(state): State<AppState>,
    Path(cleanup_type): Path<String>,
) -> Response {
    Json(cleanup::cleanup(&state.orch, &cleanup_type).await).into_response()
}

/// Log ingest from the analysis sidecar: append to the repository log
/// of the latest generation and forward to the hub.
pub async fn stream_logs(
    State(state): State<AppState>,
    Json(body): Json<StreamLogRequest>,
) -> Response {
    let generation = match db::get_latest_generation(&state.orch.pool, &body.analysis_id).await {
        Ok(Some(generation)) => generation,
        Ok(None) => {
            return response::not_found(anyhow::anyhow!(
                "no generation found for analysis {}",
                body.analysis_id
            ));
        }
        Err(e) => return response::internal_server_error(e.context("failed to load generation")),
    };

    // Logs are frozen once the generation has ended.
    if matches!(
        generation.status,
        AnalysisStatus::Finished | AnalysisStatus::Failed
    ) {
        return response::conflict(anyhow::anyhow!(
            "analysis {} has ended; its log is frozen",
            body.analysis_id
        ));
    }

    let mut log = generation
        .log
        .unwrap_or_else(|| serde_json::json!({}));
    let entry = serde_json::json!({
        "id": uuid::Uuid::new_v4(),
        "created_at": chrono::Utc::now(),
        "log": body.log,
        "log_type": body.log_type,
        "status": body.status,
        "progress": body.progress,
    });
    if !log["stream"].is_array() {
        log["stream"] = serde_json::Value::Array(Vec::new());
    }
    if let Some(stream) = log["stream"].as_array_mut() {
        stream.push(entry);
    }

    if let Err(e) = db::update_generation(
        &state.orch.pool,
        &generation.deployment_name,
        &UpdateGeneration {
            log: Some(log),
            progress: body.progress,
            ..Default::default()
        },
    )
    .await
    {
        return response::internal_server_error(e.context("failed to append log entry"));
    }

    hub::stream_log(
        &state.orch.hub,
        &body.analysis_id,
        body.log_type.as_str(),
        body.status,
        &body.log,
    )
    .await;

    Json(serde_json::json!({"status": "ok"})).into_response()
}
