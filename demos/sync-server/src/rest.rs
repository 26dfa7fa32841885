//! In-memory project and version store.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tagsync_core::{RollbackOutcome, VersionSnapshot, now_ms};
use tokio::sync::RwLock;

#[derive(Default)]
struct Project {
    state: Value,
    versions: Vec<VersionSnapshot>,
    next_version: u64,
    autosaves: u64,
}

impl Project {
    fn push_version(&mut self, message: Option<String>, is_auto: bool, state: Value) -> u64 {
        self.next_version += 1;
        let version_number = self.next_version;
        self.versions.push(VersionSnapshot {
            version_number,
            message,
            is_auto,
            created_at: Some(now_ms().to_string()),
            created_by: None,
            state: Some(state),
        });
        version_number
    }
}

struct Store {
    token: Option<String>,
    projects: HashMap<String, Project>,
}

type AppState = Arc<RwLock<Store>>;

pub async fn run(addr: SocketAddr, token: Option<String>) -> anyhow::Result<()> {
    let state = Arc::new(RwLock::new(Store {
        token,
        projects: HashMap::new(),
    }));

    let app = Router::new()
        .route("/api/projects/{id}", get(get_project).put(save))
        .route("/api/projects/{id}/autosave", post(autosave))
        .route("/api/projects/{id}/versions", get(list_versions).post(create_version))
        .route("/api/projects/{id}/versions/{version}", axum::routing::delete(delete_version))
        .route("/api/projects/{id}/versions/{version}/rollback", post(rollback))
        .with_state(state);

    tracing::info!("Project store listening on http://{}/api", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn authorize(store: &Store, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(token) = &store.token else {
        return Ok(());
    };
    let offered = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if offered == Some(token.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Deserialize, Serialize)]
struct StateBody {
    state: Value,
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StateBody>, StatusCode> {
    let s = state.read().await;
    authorize(&s, &headers)?;
    let project = s.projects.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(StateBody {
        state: project.state.clone(),
    }))
}

async fn autosave(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StateBody>,
) -> Result<StatusCode, StatusCode> {
    let mut s = state.write().await;
    authorize(&s, &headers)?;
    let project = s.projects.entry(id.clone()).or_default();
    project.state = body.state;
    project.autosaves += 1;
    tracing::info!("Autosave #{} for project {}", project.autosaves, id);
    Ok(StatusCode::NO_CONTENT)
}

async fn save(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StateBody>,
) -> Result<StatusCode, StatusCode> {
    let mut s = state.write().await;
    authorize(&s, &headers)?;
    s.projects.entry(id.clone()).or_default().state = body.state;
    tracing::info!("Saved project {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVersionRequest {
    message: Option<String>,
    #[serde(default)]
    is_auto: bool,
    state: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedVersion {
    version_number: u64,
}

async fn create_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateVersionRequest>,
) -> Result<Json<CreatedVersion>, StatusCode> {
    let mut s = state.write().await;
    authorize(&s, &headers)?;
    let project = s.projects.entry(id.clone()).or_default();
    let version_number = project.push_version(req.message, req.is_auto, req.state);
    tracing::info!("Project {} version {} (auto: {})", id, version_number, req.is_auto);
    Ok(Json(CreatedVersion { version_number }))
}

#[derive(Serialize)]
struct VersionList {
    versions: Vec<VersionSnapshot>,
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<VersionList>, StatusCode> {
    let s = state.read().await;
    authorize(&s, &headers)?;
    let versions = s
        .projects
        .get(&id)
        .map(|p| p.versions.iter().rev().cloned().collect())
        .unwrap_or_default();
    Ok(Json(VersionList { versions }))
}

async fn rollback(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u64)>,
    headers: HeaderMap,
) -> Result<Json<RollbackOutcome>, StatusCode> {
    let mut s = state.write().await;
    authorize(&s, &headers)?;
    let project = s.projects.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    let restored = project
        .versions
        .iter()
        .find(|v| v.version_number == version)
        .and_then(|v| v.state.clone())
        .ok_or(StatusCode::NOT_FOUND)?;

    project.state = restored.clone();
    let new_version = project.push_version(Some(format!("Rolled back to version {version}")), false, restored);
    tracing::info!("Project {} rolled back to version {}", id, version);
    Ok(Json(RollbackOutcome {
        rolled_back_to: version,
        new_version,
    }))
}

async fn delete_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u64)>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    let mut s = state.write().await;
    authorize(&s, &headers)?;
    let project = s.projects.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    let before = project.versions.len();
    project.versions.retain(|v| v.version_number != version);
    if project.versions.len() == before {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::NO_CONTENT)
}
