// crates/server/src/routes/workspaces.rs
//! Workspace CRUD.
//!
//! - `GET /api/workspaces`          -- list workspaces
//! - `POST /api/workspaces`         -- create a workspace
//! - `DELETE /api/workspaces/{id}`  -- delete a workspace and its sessions

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use angel_types::Workspace;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workspaces", get(list_workspaces).post(create_workspace))
        .route("/workspaces/{id}", delete(delete_workspace))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspacesResponse {
    workspaces: Vec<Workspace>,
}

async fn list_workspaces(State(state): State<Arc<AppState>>) -> ApiResult<Json<WorkspacesResponse>> {
    let workspaces = state.store.list_workspaces()?;
    Ok(Json(WorkspacesResponse { workspaces }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceRequest {
    name: String,
    #[serde(default)]
    default_system_prompt: String,
}

async fn create_workspace(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<Json<Workspace>> {
    let workspace = state
        .store
        .create_workspace(&req.name, &req.default_system_prompt)?;
    Ok(Json(workspace))
}

async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.delete_workspace(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
