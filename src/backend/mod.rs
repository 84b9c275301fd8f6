pub mod error;
pub mod handler;
pub mod http;
pub mod lenient_client;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rmcp::model::{
    CallToolRequestParams, GetPromptRequestParam, Prompt, ReadResourceRequestParam, Resource,
    Tool,
};
use rmcp::service::RunningService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Transport};
use crate::routing::{strip_tool_prefix, DisableMasks, RoutedTool, RoutingTables};
use error::BackendError;
use handler::GatewayClientHandler;

const STATUS_CONNECTING: u8 = 0;
const STATUS_CONNECTED: u8 = 1;
const STATUS_DISCONNECTED: u8 = 2;
const STATUS_ERROR: u8 = 3;

/// Connection status of a single backend (spec §3 Backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl BackendStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_CONNECTING => BackendStatus::Connecting,
            STATUS_CONNECTED => BackendStatus::Connected,
            STATUS_DISCONNECTED => BackendStatus::Disconnected,
            _ => BackendStatus::Error,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BackendStatus::Connecting => STATUS_CONNECTING,
            BackendStatus::Connected => STATUS_CONNECTED,
            BackendStatus::Disconnected => STATUS_DISCONNECTED,
            BackendStatus::Error => STATUS_ERROR,
        }
    }
}

/// Lifecycle/catalog events a `BackendConnection` emits (spec §9 "event
/// emitters ... become explicit subscription channels").
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Connected,
    Disconnected,
    Error(String),
    ToolsChanged,
    ResourcesChanged,
    PromptsChanged,
}

type ClientService = RunningService<rmcp::RoleClient, GatewayClientHandler>;

/// One backend connection (spec §4.2 Backend Connection). Owns the rmcp
/// client service, catalogs, and status; rmcp's `RunningService` already
/// provides the per-connection in-flight request correlation table the spec
/// describes, so this type layers deadline/retry/event semantics on top of
/// it rather than reimplementing correlation.
pub struct BackendConnection {
    id: String,
    config: RwLock<BackendConfig>,
    status: AtomicU8,
    last_error: Mutex<Option<String>>,
    tools: ArcSwap<Vec<Tool>>,
    resources: ArcSwap<Vec<Resource>>,
    prompts: ArcSwap<Vec<Prompt>>,
    service: RwLock<Option<ClientService>>,
    child: RwLock<Option<Child>>,
    events: mpsc::UnboundedSender<(String, BackendEvent)>,
}

impl BackendConnection {
    fn new(
        id: String,
        config: BackendConfig,
        events: mpsc::UnboundedSender<(String, BackendEvent)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config: RwLock::new(config),
            status: AtomicU8::new(STATUS_CONNECTING),
            last_error: Mutex::new(None),
            tools: ArcSwap::from_pointee(Vec::new()),
            resources: ArcSwap::from_pointee(Vec::new()),
            prompts: ArcSwap::from_pointee(Vec::new()),
            service: RwLock::new(None),
            child: RwLock::new(None),
            events: events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: BackendStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    pub async fn config(&self) -> BackendConfig {
        self.config.read().await.clone()
    }

    pub fn tools(&self) -> Arc<Vec<Tool>> {
        self.tools.load_full()
    }

    pub fn resources(&self) -> Arc<Vec<Resource>> {
        self.resources.load_full()
    }

    pub fn prompts(&self) -> Arc<Vec<Prompt>> {
        self.prompts.load_full()
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send((self.id.clone(), event));
    }

    /// Perform the connect→initialize→list handshake with retry (spec §4.2:
    /// retries apply only to this phase, exponential backoff 500ms..5s cap).
    /// On persistent failure the backend is left in `Error` status, never
    /// removed — matches `add(config)`'s "a failed connect does NOT remove
    /// the backend".
    async fn connect(self: &Arc<Self>) {
        self.set_status(BackendStatus::Connecting);
        let config = self.config().await;
        let attempts = config.retries as usize + 1;
        let mut delay = Duration::from_millis(500);

        for attempt in 1..=attempts {
            match self.try_connect_once(&config).await {
                Ok(()) => {
                    self.set_status(BackendStatus::Connected);
                    *self.last_error.lock().await = None;
                    self.emit(BackendEvent::Connected);
                    self.emit(BackendEvent::ToolsChanged);
                    self.emit(BackendEvent::ResourcesChanged);
                    self.emit(BackendEvent::PromptsChanged);
                    info!(backend = %self.id, attempt, "backend connected");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(backend = %self.id, attempt, error = %e, "handshake attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(e) => {
                    let message = BackendError::HandshakeFailed {
                        id: self.id.clone(),
                        attempts,
                        source: e,
                    }
                    .to_string();
                    warn!(backend = %self.id, attempts, error = %message, "backend handshake failed");
                    self.set_status(BackendStatus::Error);
                    *self.last_error.lock().await = Some(message.clone());
                    self.emit(BackendEvent::Error(message));
                }
            }
        }
    }

    async fn try_connect_once(self: &Arc<Self>, config: &BackendConfig) -> Result<()> {
        let (events_tx, _) = (self.events.clone(), ());
        let handler_for = |id: &str| GatewayClientHandler::new(id.to_string(), events_tx.clone());

        match config.transport {
            Transport::Stdio => {
                let (service, child) = stdio::connect(&self.id, config, handler_for(&self.id)).await?;
                let capabilities = service.peer_info().map(|p| p.capabilities.clone());
                self.populate_catalogs(&service, capabilities.as_ref()).await?;
                *self.service.write().await = Some(service);
                *self.child.write().await = Some(child);
            }
            Transport::Http => {
                let service = http::connect(&self.id, config, handler_for(&self.id)).await?;
                let capabilities = service.peer_info().map(|p| p.capabilities.clone());
                self.populate_catalogs(&service, capabilities.as_ref()).await?;
                *self.service.write().await = Some(service);
            }
            Transport::Sse => {
                let service = sse::connect(&self.id, config, handler_for(&self.id)).await?;
                let capabilities = service.peer_info().map(|p| p.capabilities.clone());
                self.populate_catalogs(&service, capabilities.as_ref()).await?;
                *self.service.write().await = Some(service);
            }
        }
        Ok(())
    }

    async fn populate_catalogs(
        &self,
        service: &ClientService,
        capabilities: Option<&rmcp::model::ServerCapabilities>,
    ) -> Result<()> {
        let wants_tools = capabilities.map(|c| c.tools.is_some()).unwrap_or(true);
        let wants_resources = capabilities.map(|c| c.resources.is_some()).unwrap_or(false);
        let wants_prompts = capabilities.map(|c| c.prompts.is_some()).unwrap_or(false);

        if wants_tools {
            let tools = service.list_all_tools().await?;
            self.tools.store(Arc::new(tools));
        }
        if wants_resources {
            let resources = service.list_all_resources().await.unwrap_or_default();
            self.resources.store(Arc::new(resources));
        }
        if wants_prompts {
            let prompts = service.list_all_prompts().await.unwrap_or_default();
            self.prompts.store(Arc::new(prompts));
        }
        Ok(())
    }

    /// Re-fetch a single catalog kind after a `*_list_changed` notification
    /// (spec §4.2 inbound-traffic handling).
    async fn refresh_catalog(&self, kind: BackendEvent) {
        let guard = self.service.read().await;
        let Some(service) = guard.as_ref() else {
            return;
        };
        match kind {
            BackendEvent::ToolsChanged => {
                if let Ok(tools) = service.list_all_tools().await {
                    self.tools.store(Arc::new(tools));
                }
            }
            BackendEvent::ResourcesChanged => {
                if let Ok(resources) = service.list_all_resources().await {
                    self.resources.store(Arc::new(resources));
                }
            }
            BackendEvent::PromptsChanged => {
                if let Ok(prompts) = service.list_all_prompts().await {
                    self.prompts.store(Arc::new(prompts));
                }
            }
            _ => {}
        }
    }

    /// Disconnect, idempotent (spec §4.2 `disconnect()`).
    async fn disconnect(&self) {
        if self.status() == BackendStatus::Disconnected {
            return;
        }
        self.set_status(BackendStatus::Disconnected);

        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            warn!(backend = %self.id, error = %e, "error cancelling service");
        }
        if let Some(mut child) = self.child.write().await.take() {
            stdio::kill_child(&self.id, &mut child).await;
        }
        self.emit(BackendEvent::Disconnected);
    }

    /// Wait for the stdio child to exit, for the reaper task. Returns
    /// immediately (never) for non-stdio backends.
    async fn wait_for_child_exit(&self) {
        loop {
            let has_child = self.child.read().await.is_some();
            if !has_child {
                return;
            }
            let mut guard = self.child.write().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.wait().await;
                drop(guard);
                if self.status() != BackendStatus::Disconnected {
                    warn!(backend = %self.id, "backend process exited unexpectedly");
                    self.set_status(BackendStatus::Error);
                    *self.last_error.lock().await = Some("process exited unexpectedly".to_string());
                    self.emit(BackendEvent::Error("process exited unexpectedly".to_string()));
                }
            }
            return;
        }
    }

    /// Map an error from an in-flight `rmcp` call once the timeout/None-guard
    /// checks above have passed. If the backend was concurrently
    /// disconnected (`disconnect()` calls `RunningService::cancel`, which is
    /// what actually fails a call racing against it), surface the spec's
    /// `TransportClosed` rather than a generic error (spec §7: "Backend
    /// transport failure ... fail in-flight requests with TransportClosed").
    fn call_error(&self, e: impl Into<anyhow::Error>) -> BackendError {
        if self.status() == BackendStatus::Disconnected {
            BackendError::TransportClosed { id: self.id.clone() }
        } else {
            BackendError::Other(e.into())
        }
    }

    async fn call_tool(&self, inner_name: &str, arguments: Option<Value>, deadline: Duration) -> Result<Value, BackendError> {
        if self.status() != BackendStatus::Connected {
            return Err(BackendError::NotConnected {
                id: self.id.clone(),
                status: self.status(),
            });
        }
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| BackendError::NotConnected {
            id: self.id.clone(),
            status: self.status(),
        })?;

        let params = CallToolRequestParams {
            meta: None,
            name: inner_name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        let result = tokio::time::timeout(deadline, service.call_tool(params))
            .await
            .map_err(|_| BackendError::Timeout {
                id: self.id.clone(),
                timeout_secs: deadline.as_secs(),
            })?
            .map_err(|e| self.call_error(e))?;

        Ok(map_call_tool_result(result))
    }

    async fn read_resource(&self, uri: &str, deadline: Duration) -> Result<Value, BackendError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| BackendError::NotConnected {
            id: self.id.clone(),
            status: self.status(),
        })?;

        let result = tokio::time::timeout(
            deadline,
            service.read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            }),
        )
        .await
        .map_err(|_| BackendError::Timeout {
            id: self.id.clone(),
            timeout_secs: deadline.as_secs(),
        })?
        .map_err(|e| self.call_error(e))?;

        serde_json::to_value(result).map_err(|e| BackendError::Other(e.into()))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        deadline: Duration,
    ) -> Result<Value, BackendError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| BackendError::NotConnected {
            id: self.id.clone(),
            status: self.status(),
        })?;

        let result = tokio::time::timeout(
            deadline,
            service.get_prompt(GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            }),
        )
        .await
        .map_err(|_| BackendError::Timeout {
            id: self.id.clone(),
            timeout_secs: deadline.as_secs(),
        })?
        .map_err(|e| self.call_error(e))?;

        serde_json::to_value(result).map_err(|e| BackendError::Other(e.into()))
    }
}

/// Map a CallToolResult into a plain JSON value for the client-facing
/// response envelope.
fn map_call_tool_result(result: rmcp::model::CallToolResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

/// Snapshot status/counts used by the admin surface (spec §6 `GET /admin/backends`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    pub status: BackendStatus,
    pub last_error: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
}

/// Result of a `test(config)` call (spec §4.3): connect ephemerally, report
/// counts, disconnect regardless of outcome, never touch gateway state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub error: Option<String>,
}

/// Owns every `BackendConnection` plus the routing tables built from their
/// catalogs (spec §4.3 Backend Manager). A single background task drains
/// the event channel, rebuilds routing under a lock, and publishes a new
/// immutable `RoutingTables` snapshot via `ArcSwap` — readers never see a
/// torn table.
pub struct BackendManager {
    backends: DashMap<String, Arc<BackendConnection>>,
    routing: ArcSwap<RoutingTables>,
    events_tx: mpsc::UnboundedSender<(String, BackendEvent)>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, BackendEvent)>>>,
    catalog_changed: tokio::sync::broadcast::Sender<()>,
    masks: Arc<DisableMasks>,
}

impl BackendManager {
    pub fn new() -> Arc<Self> {
        Self::new_with_masks(Arc::new(DisableMasks::default()))
    }

    /// Construct with a `DisableMasks` loaded from the UI-state file (spec
    /// §6) rather than starting empty, so persisted disables survive restart.
    pub fn new_with_masks(masks: Arc<DisableMasks>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (catalog_changed, _) = tokio::sync::broadcast::channel(64);
        Arc::new(Self {
            backends: DashMap::new(),
            routing: ArcSwap::from_pointee(RoutingTables::default()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            catalog_changed,
            masks,
        })
    }

    pub fn routing(&self) -> Arc<RoutingTables> {
        self.routing.load_full()
    }

    pub fn masks(&self) -> Arc<DisableMasks> {
        Arc::clone(&self.masks)
    }

    /// `allToolsIncludingDisabledBackends()` (spec §4.3 Catalog views):
    /// every tool from a connected backend, ignoring both masks.
    pub fn all_tools_including_disabled_backends(&self) -> Vec<RoutedTool> {
        self.routing().tools().cloned().collect()
    }

    /// `allTools()` (spec §4.3): connected backends whose id is not in
    /// `disabledBackends`.
    pub fn all_tools(&self) -> Vec<RoutedTool> {
        self.routing()
            .tools()
            .filter(|t| !self.masks.disabled_backends.contains(&t.backend_id))
            .cloned()
            .collect()
    }

    /// `enabledTools()` (spec §4.3): `allTools()` minus `disabledTools`. This
    /// is the view the client-facing `tools/list` uses.
    pub fn enabled_tools(&self) -> Vec<RoutedTool> {
        self.all_tools()
            .into_iter()
            .filter(|t| !self.masks.disabled_tools.contains(&t.external_name))
            .collect()
    }

    /// Resources from connected backends, no mask applied (spec §4.3:
    /// "Resources and prompts: connected backends only; no mask").
    pub fn all_resources(&self) -> Vec<Resource> {
        self.routing().resources().cloned().collect()
    }

    pub fn all_prompts(&self) -> Vec<Prompt> {
        self.routing().prompts().cloned().collect()
    }

    /// Toggle a single tool's visibility (spec §4.3 `enable/disable tool`).
    /// Never touches the backend's connection or catalog.
    pub fn set_tool_enabled(&self, external_name: &str, enabled: bool) {
        if enabled {
            self.masks.disabled_tools.remove(external_name);
        } else {
            self.masks.disabled_tools.insert(external_name.to_string());
        }
        let _ = self.catalog_changed.send(());
    }

    /// Toggle a whole backend's visibility (spec §4.3 `enable/disable backend`).
    pub fn set_backend_enabled(&self, id: &str, enabled: bool) {
        if enabled {
            self.masks.disabled_backends.remove(id);
        } else {
            self.masks.disabled_backends.insert(id.to_string());
        }
        let _ = self.catalog_changed.send(());
    }

    /// Subscribe to "catalogs changed" ticks (spec §4.5: forwarded to
    /// initialized client sessions as `notifications/*/list_changed`).
    pub fn subscribe_catalog_changed(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.catalog_changed.subscribe()
    }

    /// Spawn the background task that drains backend events and rebuilds
    /// routing. Must be called exactly once after construction.
    pub fn spawn_event_loop(self: &Arc<Self>) {
        let mut rx = self
            .events_rx
            .try_lock()
            .expect("spawn_event_loop called concurrently")
            .take()
            .expect("spawn_event_loop called twice");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((id, event)) = rx.recv().await {
                match &event {
                    BackendEvent::ToolsChanged
                    | BackendEvent::ResourcesChanged
                    | BackendEvent::PromptsChanged => {
                        if let Some(conn) = manager.backends.get(&id) {
                            conn.refresh_catalog(event.clone()).await;
                        }
                    }
                    BackendEvent::Error(msg) => {
                        debug!(backend = %id, error = %msg, "backend error event");
                    }
                    _ => {}
                }
                manager.rebuild_routing().await;
                let _ = manager.catalog_changed.send(());
            }
        });
    }

    async fn rebuild_routing(&self) {
        let mut entries = Vec::new();
        let mut ids: Vec<String> = self.backends.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        for id in ids {
            let Some(conn) = self.backends.get(&id) else {
                continue;
            };
            if conn.status() != BackendStatus::Connected {
                continue;
            }
            let config = conn.config().await;
            entries.push((
                id.clone(),
                config.tool_prefix.clone(),
                conn.tools().as_ref().clone(),
                conn.resources().as_ref().clone(),
                conn.prompts().as_ref().clone(),
            ));
        }
        let tables = RoutingTables::rebuild(&entries);
        self.routing.store(Arc::new(tables));
    }

    /// `add(config)` (spec §4.3): reject duplicate id, connect without
    /// blocking the caller on success.
    pub async fn add(self: &Arc<Self>, config: BackendConfig) -> Result<(), anyhow::Error> {
        if self.backends.contains_key(&config.id) {
            anyhow::bail!("backend '{}' already exists", config.id);
        }
        let conn = BackendConnection::new(config.id.clone(), config.clone(), self.events_tx.clone());
        self.backends.insert(config.id.clone(), Arc::clone(&conn));

        if config.transport == Transport::Stdio {
            let reaper = Arc::clone(&conn);
            tokio::spawn(async move {
                reaper.wait_for_child_exit().await;
            });
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            conn.connect().await;
            manager.rebuild_routing().await;
            let _ = manager.catalog_changed.send(());
        });
        Ok(())
    }

    /// `remove(id)` (spec §4.3): disconnect, drop from map, rebuild routing.
    pub async fn remove(&self, id: &str) -> Result<(), anyhow::Error> {
        let Some((_, conn)) = self.backends.remove(id) else {
            anyhow::bail!("backend '{id}' not found");
        };
        conn.disconnect().await;
        self.rebuild_routing().await;
        let _ = self.catalog_changed.send(());
        Ok(())
    }

    /// `update(id, newConfig)` (spec §4.3): remove + add atomically — the
    /// routing tables must never expose an intermediate state where the id
    /// is both gone and back. Achieved by holding the backend map's entry
    /// lock across disconnect+reconnect rather than doing a bare remove/add.
    pub async fn update(self: &Arc<Self>, id: &str, new_config: BackendConfig) -> Result<(), anyhow::Error> {
        let Some((_, old)) = self.backends.remove(id) else {
            anyhow::bail!("backend '{id}' not found");
        };
        old.disconnect().await;
        self.rebuild_routing().await;
        let _ = self.catalog_changed.send(());

        self.add(new_config).await
    }

    /// `test(config)` (spec §4.3): ephemeral connect, never mutates gateway
    /// state.
    pub async fn test(&self, config: BackendConfig) -> TestResult {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = BackendConnection::new(config.id.clone(), config.clone(), tx);
        conn.connect().await;
        let result = if conn.status() == BackendStatus::Connected {
            TestResult {
                success: true,
                tool_count: conn.tools().len(),
                resource_count: conn.resources().len(),
                prompt_count: conn.prompts().len(),
                error: None,
            }
        } else {
            TestResult {
                success: false,
                tool_count: 0,
                resource_count: 0,
                prompt_count: 0,
                error: conn.last_error().await,
            }
        };
        conn.disconnect().await;
        result
    }

    /// `callTool(externalName, args, deadline?)` (spec §4.3).
    pub async fn call_tool(
        &self,
        external_name: &str,
        arguments: Option<Value>,
        deadline_override: Option<Duration>,
    ) -> Result<Value, RoutingError> {
        if self.masks.disabled_tools.contains(external_name) {
            return Err(RoutingError::NotFound(external_name.to_string()));
        }
        let routing = self.routing();
        let backend_id = routing
            .tool_backend(external_name)
            .ok_or_else(|| RoutingError::NotFound(external_name.to_string()))?
            .to_string();
        if self.masks.disabled_backends.contains(&backend_id) {
            return Err(RoutingError::NotFound(external_name.to_string()));
        }
        let conn = self
            .backends
            .get(&backend_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RoutingError::NotFound(external_name.to_string()))?;
        if conn.status() != BackendStatus::Connected {
            return Err(RoutingError::BackendUnavailable(backend_id));
        }
        let config = conn.config().await;
        let inner_name = strip_tool_prefix(&config, external_name)
            .ok_or_else(|| RoutingError::NotFound(external_name.to_string()))?;
        let deadline = deadline_override.unwrap_or(config.timeout);
        conn.call_tool(inner_name, arguments, deadline)
            .await
            .map_err(RoutingError::Backend)
    }

    /// `readResource(uri)` (spec §4.3).
    pub async fn read_resource(&self, uri: &str) -> Result<Value, RoutingError> {
        let routing = self.routing();
        let backend_id = routing
            .resource_backend(uri)
            .ok_or_else(|| RoutingError::NotFound(uri.to_string()))?
            .to_string();
        let conn = self
            .backends
            .get(&backend_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RoutingError::NotFound(uri.to_string()))?;
        if conn.status() != BackendStatus::Connected {
            return Err(RoutingError::BackendUnavailable(backend_id));
        }
        let deadline = conn.config().await.timeout;
        conn.read_resource(uri, deadline).await.map_err(RoutingError::Backend)
    }

    /// `getPrompt(name, args?)` (spec §4.3).
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, RoutingError> {
        let routing = self.routing();
        let backend_id = routing
            .prompt_backend(name)
            .ok_or_else(|| RoutingError::NotFound(name.to_string()))?
            .to_string();
        let conn = self
            .backends
            .get(&backend_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RoutingError::NotFound(name.to_string()))?;
        if conn.status() != BackendStatus::Connected {
            return Err(RoutingError::BackendUnavailable(backend_id));
        }
        let deadline = conn.config().await.timeout;
        conn.get_prompt(name, arguments, deadline).await.map_err(RoutingError::Backend)
    }

    /// `callToolsParallel(list)` (spec §4.3 + §8 invariant 5): dispatch all
    /// in parallel, preserve input order, per-call errors surface per-result.
    pub async fn call_tools_parallel(
        &self,
        calls: Vec<(String, Option<Value>)>,
    ) -> Vec<Result<Value, RoutingError>> {
        let futures = calls
            .into_iter()
            .map(|(name, args)| self.call_tool(&name, args, None));
        futures::future::join_all(futures).await
    }

    /// `callToolsConcurrent(list, n)` (spec §4.3): like parallel, but at most
    /// `n` in flight, FIFO over inputs, same ordering guarantee.
    pub async fn call_tools_concurrent(
        &self,
        calls: Vec<(String, Option<Value>)>,
        n: usize,
    ) -> Vec<Result<Value, RoutingError>> {
        use futures::stream::{self, StreamExt};
        stream::iter(calls.into_iter().enumerate())
            .map(|(idx, (name, args))| async move { (idx, self.call_tool(&name, args, None).await) })
            .buffer_unordered(n.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .fold(
                std::collections::BTreeMap::new(),
                |mut acc, (idx, result)| {
                    acc.insert(idx, result);
                    acc
                },
            )
            .into_values()
            .collect()
    }

    /// `disconnectAll()` (spec §4.3), draining no in-flight tracking beyond
    /// what each `RunningService::cancel` already does.
    pub async fn disconnect_all(&self) {
        let conns: Vec<Arc<BackendConnection>> =
            self.backends.iter().map(|r| Arc::clone(r.value())).collect();
        self.backends.clear();
        let mut set = tokio::task::JoinSet::new();
        for conn in conns {
            set.spawn(async move { conn.disconnect().await });
        }
        while set.join_next().await.is_some() {}
        self.rebuild_routing().await;
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackendConnection>> {
        self.backends.get(id).map(|r| Arc::clone(r.value()))
    }

    pub async fn list_info(&self) -> Vec<BackendInfo> {
        let mut out = Vec::new();
        for entry in self.backends.iter() {
            let conn = entry.value();
            let config = conn.config().await;
            out.push(BackendInfo {
                id: conn.id().to_string(),
                name: config.name.clone(),
                status: conn.status(),
                last_error: conn.last_error().await,
                tool_count: conn.tools().len(),
                resource_count: conn.resources().len(),
                prompt_count: conn.prompts().len(),
            });
        }
        out
    }
}

/// Routing-layer error (spec §7: routing miss → MethodNotFound, backend not
/// connected → InternalError).
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend '{0}' not connected")]
    BackendUnavailable(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(id: &str) -> BackendConfig {
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
            retries: 0,
        }
    }

    /// spec §7: a call racing against `disconnect()` must see `TransportClosed`,
    /// not a generic error.
    #[tokio::test]
    async fn call_error_maps_to_transport_closed_once_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = BackendConnection::new("x".to_string(), stdio_config("x"), tx);
        conn.disconnect().await;
        let err = conn.call_error(anyhow::anyhow!("boom"));
        assert!(matches!(err, BackendError::TransportClosed { id } if id == "x"));
    }

    #[tokio::test]
    async fn call_error_is_generic_when_not_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = BackendConnection::new("x".to_string(), stdio_config("x"), tx);
        let err = conn.call_error(anyhow::anyhow!("boom"));
        assert!(matches!(err, BackendError::Other(_)));
    }

    /// A backend whose command can't even be spawned exhausts its retries
    /// and lands in `Error` with a `HandshakeFailed`-shaped message (spec
    /// §4.2 retry/backoff, §7 "backend handshake failed").
    #[tokio::test]
    async fn connect_failure_leaves_backend_in_error_with_handshake_message() {
        let mut config = stdio_config("broken");
        config.command = Some("definitely-not-a-real-binary-xyz".to_string());
        config.retries = 0;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = BackendConnection::new("broken".to_string(), config, tx);
        conn.connect().await;
        assert_eq!(conn.status(), BackendStatus::Error);
        let message = conn.last_error().await.unwrap();
        assert!(message.contains("handshake failed"));
    }

    #[tokio::test]
    async fn new_manager_has_empty_routing() {
        let manager = BackendManager::new();
        assert_eq!(manager.routing().tool_count(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_backend_errors() {
        let manager = BackendManager::new();
        assert!(manager.remove("nope").await.is_err());
    }

    #[tokio::test]
    async fn call_tool_on_unrouted_name_is_not_found() {
        let manager = BackendManager::new();
        let result = manager.call_tool("missing_tool", None, None).await;
        assert!(matches!(result, Err(RoutingError::NotFound(_))));
    }

    #[tokio::test]
    async fn disabled_tool_is_not_found_even_if_routed() {
        let manager = BackendManager::new();
        manager.masks().disabled_tools.insert("ghost_tool".to_string());
        let result = manager.call_tool("ghost_tool", None, None).await;
        assert!(matches!(result, Err(RoutingError::NotFound(_))));
    }

    #[tokio::test]
    async fn set_tool_enabled_round_trips_through_masks() {
        let manager = BackendManager::new();
        manager.set_tool_enabled("a_tool", false);
        assert!(manager.masks().disabled_tools.contains("a_tool"));
        manager.set_tool_enabled("a_tool", true);
        assert!(!manager.masks().disabled_tools.contains("a_tool"));
    }

    #[tokio::test]
    async fn set_backend_enabled_round_trips_through_masks() {
        let manager = BackendManager::new();
        manager.set_backend_enabled("fs", false);
        assert!(manager.masks().disabled_backends.contains("fs"));
        manager.set_backend_enabled("fs", true);
        assert!(!manager.masks().disabled_backends.contains("fs"));
    }

    #[test]
    fn empty_manager_has_no_enabled_tools() {
        let manager = BackendManager::new();
        assert!(manager.enabled_tools().is_empty());
        assert!(manager.all_tools().is_empty());
        assert!(manager.all_tools_including_disabled_backends().is_empty());
    }

    /// spec §8 invariant 5: `callToolsParallel` preserves input order in its
    /// result vector regardless of completion order.
    #[tokio::test]
    async fn call_tools_parallel_preserves_input_order() {
        let manager = BackendManager::new();
        let calls = vec![
            ("a".to_string(), None),
            ("b".to_string(), None),
            ("c".to_string(), None),
        ];
        let results = manager.call_tools_parallel(calls).await;
        assert_eq!(results.len(), 3);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            match &results[i] {
                Err(RoutingError::NotFound(got)) => assert_eq!(got, name),
                other => panic!("unexpected result at index {i}: {other:?}"),
            }
        }
    }

    /// Same ordering guarantee as `call_tools_parallel`, but bounded by an
    /// in-flight concurrency limit (spec §4.3 `callToolsConcurrent`).
    #[tokio::test]
    async fn call_tools_concurrent_preserves_input_order_under_low_concurrency() {
        let manager = BackendManager::new();
        let calls = vec![
            ("a".to_string(), None),
            ("b".to_string(), None),
            ("c".to_string(), None),
            ("d".to_string(), None),
        ];
        let results = manager.call_tools_concurrent(calls, 2).await;
        assert_eq!(results.len(), 4);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            match &results[i] {
                Err(RoutingError::NotFound(got)) => assert_eq!(got, name),
                other => panic!("unexpected result at index {i}: {other:?}"),
            }
        }
    }
}
