//! Admin Control Plane (spec §4.6, §6 "Admin HTTP surface"): the read/write
//! REST surface an operator (or an admin UI) uses to inspect and reconfigure
//! the gateway without touching the servers config file by hand.
//!
//! Every write here goes through the same path a human editing the config
//! file and restarting would take: validate, persist atomically, then apply
//! to the live `BackendManager`. The disable-mask endpoints never touch a
//! backend's connection — they only change what the client-facing catalog
//! in `server.rs` shows (spec §4.3 "never a reason to close a backend").

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::backend::{BackendInfo, BackendManager, TestResult};
use crate::config::{BackendConfig, Config};
use crate::session::{SessionInfo, SessionStore};
use crate::uistate;

#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<ArcSwap<Config>>,
    pub backend_manager: Arc<BackendManager>,
    pub sessions: Arc<SessionStore>,
    pub config_path: PathBuf,
    pub ui_state_path: PathBuf,
    /// Signaled by `POST /admin/restart`; the main task awaits this to know
    /// when to tear the process down (spec §6 "restart").
    pub restart: Arc<Notify>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/backends", get(list_backends))
        .route("/admin/tools", get(list_tools))
        .route("/admin/servers/{id}", get(get_server))
        .route("/admin/config/export", get(export_config))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{id}", delete(evict_session))
        .route("/admin/tools/{name}/toggle", post(toggle_tool))
        .route("/admin/backends/{id}/toggle", post(toggle_backend))
        .route("/admin/tools/bulk", post(bulk_toggle_tools))
        .route("/admin/servers", post(add_server))
        .route("/admin/servers/{id}", put(update_server))
        .route("/admin/servers/{id}", delete(remove_server))
        .route("/admin/servers/test", post(test_server))
        .route("/admin/config/import", post(import_config))
        .route("/admin/restart", post(restart))
        .with_state(state)
}

/// Errors this surface can return, mapped to the status codes spec §7
/// prescribes for the admin plane: 4xx for validation, 404 for unknown ids,
/// 5xx for everything that failed on our side rather than the caller's.
enum AdminError {
    NotFound(String),
    Validation(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            AdminError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AdminError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<anyhow::Error> for AdminError {
    fn from(e: anyhow::Error) -> Self {
        AdminError::Internal(e)
    }
}

type AdminResult<T> = Result<T, AdminError>;

// --- read endpoints ---------------------------------------------------

async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendInfo>> {
    Json(state.backend_manager.list_info().await)
}

/// One tool entry as the admin surface sees it: unlike the client-facing
/// `tools/list`, this always includes disabled tools and backends, tagged
/// with whether they are currently masked (spec §4.3 invariant: "the admin
/// surface still sees them").
#[derive(Serialize)]
struct AdminToolEntry {
    external_name: String,
    backend_id: String,
    tool_enabled: bool,
    backend_enabled: bool,
}

async fn list_tools(State(state): State<AdminState>) -> Json<Vec<AdminToolEntry>> {
    let masks = state.backend_manager.masks();
    let entries = state
        .backend_manager
        .all_tools_including_disabled_backends()
        .into_iter()
        .map(|t| AdminToolEntry {
            tool_enabled: !masks.disabled_tools.contains(&t.external_name),
            backend_enabled: !masks.disabled_backends.contains(&t.backend_id),
            external_name: t.external_name,
            backend_id: t.backend_id,
        })
        .collect();
    Json(entries)
}

async fn get_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<BackendConfig>> {
    let config = state.config.load();
    config
        .backends
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| AdminError::NotFound(format!("no such backend: {id}")))
}

#[derive(Serialize)]
struct ExportResponse {
    servers: Vec<BackendConfig>,
}

async fn export_config(State(state): State<AdminState>) -> Json<ExportResponse> {
    Json(ExportResponse {
        servers: state.config.load().export_servers(),
    })
}

/// `GET /admin/sessions`: every tracked client session (spec §3 Session),
/// for operator visibility into what's currently connected and whether the
/// idle reaper will be collecting it soon.
async fn list_sessions(State(state): State<AdminState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

/// `DELETE /admin/sessions/{id}`: force an idle/stuck session out of the
/// admin-facing session store. This only stops the gateway's own
/// bookkeeping (idle GC, `list_sessions`); the underlying transport session,
/// if still live, is torn down separately by rmcp's session manager on its
/// own terms.
async fn evict_session(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    if state.sessions.get(&id).is_none() {
        return Err(AdminError::NotFound(format!("no such session: {id}")));
    }
    state.sessions.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

// --- disable-mask writes -----------------------------------------------

#[derive(Deserialize)]
struct Toggle {
    enabled: bool,
}

async fn toggle_tool(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<Toggle>,
) -> AdminResult<StatusCode> {
    state.backend_manager.set_tool_enabled(&name, body.enabled);
    persist_masks(&state).await?;
    Ok(StatusCode::OK)
}

async fn toggle_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<Toggle>,
) -> AdminResult<StatusCode> {
    state.backend_manager.set_backend_enabled(&id, body.enabled);
    persist_masks(&state).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct BulkToggle {
    tools: Vec<String>,
    enabled: bool,
}

async fn bulk_toggle_tools(
    State(state): State<AdminState>,
    Json(body): Json<BulkToggle>,
) -> AdminResult<StatusCode> {
    for name in &body.tools {
        state.backend_manager.set_tool_enabled(name, body.enabled);
    }
    persist_masks(&state).await?;
    Ok(StatusCode::OK)
}

async fn persist_masks(state: &AdminState) -> AdminResult<()> {
    uistate::save(&state.ui_state_path, &state.backend_manager.masks())
        .await
        .map_err(AdminError::Internal)
}

// --- server (backend) writes --------------------------------------------

async fn add_server(
    State(state): State<AdminState>,
    Json(new_backend): Json<BackendConfig>,
) -> AdminResult<StatusCode> {
    new_backend
        .validate()
        .map_err(|e| AdminError::Validation(e.to_string()))?;

    let config = state.config.load();
    if config.backends.contains_key(&new_backend.id) {
        return Err(AdminError::Validation(format!(
            "backend '{}' already exists",
            new_backend.id
        )));
    }

    let mut next = (**config).clone();
    next.backends.insert(new_backend.id.clone(), new_backend.clone());
    next.save(&state.config_path).await?;
    state.config.store(Arc::new(next));

    state.backend_manager.add(new_backend).await?;
    Ok(StatusCode::CREATED)
}

async fn update_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(mut updated): Json<BackendConfig>,
) -> AdminResult<StatusCode> {
    updated.id = id.clone();
    updated
        .validate()
        .map_err(|e| AdminError::Validation(e.to_string()))?;

    let config = state.config.load();
    if !config.backends.contains_key(&id) {
        return Err(AdminError::NotFound(format!("no such backend: {id}")));
    }

    let mut next = (**config).clone();
    next.backends.insert(id.clone(), updated.clone());
    next.save(&state.config_path).await?;
    state.config.store(Arc::new(next));

    state.backend_manager.update(&id, updated).await?;
    Ok(StatusCode::OK)
}

async fn remove_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    let config = state.config.load();
    if !config.backends.contains_key(&id) {
        return Err(AdminError::NotFound(format!("no such backend: {id}")));
    }

    let mut next = (**config).clone();
    next.backends.remove(&id);
    next.save(&state.config_path).await?;
    state.config.store(Arc::new(next));

    state.backend_manager.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_server(
    State(state): State<AdminState>,
    Json(candidate): Json<BackendConfig>,
) -> AdminResult<Json<TestResult>> {
    candidate
        .validate()
        .map_err(|e| AdminError::Validation(e.to_string()))?;
    Ok(Json(state.backend_manager.test(candidate).await))
}

#[derive(Deserialize)]
struct ImportRequest {
    servers: Vec<BackendConfig>,
    #[serde(default)]
    merge: bool,
}

/// `merge: true` only adds/updates the given servers, leaving anything not
/// in the list untouched. `merge: false` (default) replaces the whole backend
/// set, removing anything not present in `servers` (spec §6 "replace vs
/// merge modes").
async fn import_config(
    State(state): State<AdminState>,
    Json(body): Json<ImportRequest>,
) -> AdminResult<StatusCode> {
    for backend in &body.servers {
        backend
            .validate()
            .map_err(|e| AdminError::Validation(format!("backend '{}': {e}", backend.id)))?;
    }

    let config = state.config.load();
    let mut next = (**config).clone();

    if body.merge {
        for backend in &body.servers {
            next.backends.insert(backend.id.clone(), backend.clone());
        }
    } else {
        next.backends = body
            .servers
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();
    }

    next.save(&state.config_path).await?;
    let diff = config.diff_backends(&next);
    state.config.store(Arc::new(next));

    for id in &diff.removed {
        if let Err(e) = state.backend_manager.remove(id).await {
            warn!(backend = %id, error = %e, "failed to remove backend during config import");
        }
    }
    for backend in diff.changed.into_iter().chain(diff.added) {
        let id = backend.id.clone();
        let result = if state.backend_manager.get(&id).is_some() {
            state.backend_manager.update(&id, backend).await
        } else {
            state.backend_manager.add(backend).await
        };
        if let Err(e) = result {
            warn!(backend = %id, error = %e, "failed to apply backend during config import");
        }
    }

    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct RestartRequest {
    confirm: String,
}

/// Requires an explicit confirmation string so a stray POST can't take the
/// gateway down (spec §6: `{confirm:"restart-confirmed"}`).
async fn restart(
    State(state): State<AdminState>,
    Json(body): Json<RestartRequest>,
) -> AdminResult<StatusCode> {
    if body.confirm != "restart-confirmed" {
        return Err(AdminError::Validation(
            "confirm must be exactly \"restart-confirmed\"".to_string(),
        ));
    }
    info!("admin-triggered restart requested");
    state.restart.notify_waiters();
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendManager;
    use crate::config::{AdminConfig, Transport};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            log_level: "info".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3000,
            admin: AdminConfig::default(),
            session_idle_timeout: Duration::from_secs(1800),
            backends: HashMap::new(),
        }
    }

    fn test_state() -> (AdminState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AdminState {
            config: Arc::new(ArcSwap::from_pointee(test_config())),
            backend_manager: BackendManager::new(),
            sessions: Arc::new(SessionStore::new(Duration::from_secs(1800))),
            config_path: dir.path().join("gateway.yaml"),
            ui_state_path: dir.path().join("ui-state.json"),
            restart: Arc::new(Notify::new()),
        };
        (state, dir)
    }

    fn stdio_backend(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            enabled: true,
            transport: Transport::Stdio,
            command: Some("echo".to_string()),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            tool_prefix: None,
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }

    #[tokio::test]
    async fn get_unknown_server_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/servers/nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_sessions_is_empty_for_fresh_state() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/sessions")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let sessions: Vec<SessionInfo> = serde_json::from_slice(&body).unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn list_sessions_reflects_tracked_session() {
        let (state, _dir) = test_state();
        state.sessions.track("s1".to_string());
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/sessions")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let sessions: Vec<SessionInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
    }

    #[tokio::test]
    async fn evict_unknown_session_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/admin/sessions/nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn evict_tracked_session_removes_it() {
        let (state, _dir) = test_state();
        state.sessions.track("s1".to_string());
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/admin/sessions/s1")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn export_config_is_empty_for_fresh_state() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/config/export")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn add_server_persists_to_config_file_and_manager() {
        let (state, dir) = test_state();
        let config_path = state.config_path.clone();
        let app = router(state);

        let body = serde_json::to_vec(&stdio_backend("fs")).unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/admin/servers")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(config_path.exists());
        drop(dir);
    }

    #[tokio::test]
    async fn add_server_rejects_invalid_config() {
        let (state, _dir) = test_state();
        let app = router(state);
        let mut bad = stdio_backend("fs");
        bad.command = None;

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/admin/servers")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&bad).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn restart_requires_exact_confirmation_string() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/admin/restart")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"confirm":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
