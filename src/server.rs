//! Protocol Handler: the client-facing MCP surface (spec §4.5).
//!
//! `GatewayHandler` implements `rmcp::ServerHandler` by delegating every
//! request straight to the `BackendManager`'s routing tables and catalog
//! views — it never caches or reshapes a backend's response (spec §9: "the
//! gateway never reshapes payloads"). One `GatewayHandler` is constructed per
//! client connection by the `StreamableHttpService`/`SseServer` factory
//! closures, so each instance owns its own session bookkeeping.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ErrorCode, ErrorData as McpError, GetPromptRequestParams,
    GetPromptResult, Implementation, ListPromptsResult, ListToolsResult, ListResourcesResult,
    PaginatedRequestParams, Prompt, ProtocolVersion, ReadResourceRequestParams, ReadResourceResult,
    Resource, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{Peer, RequestContext};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::{sse_server::SseServerConfig, SseServer};
use rmcp::{RoleServer, ServerHandler};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendManager, RoutingError};
use crate::routing::RoutedTool;
use crate::session::SessionStore;

fn routing_error_to_mcp(err: RoutingError) -> McpError {
    match err {
        RoutingError::NotFound(what) => {
            McpError::new(ErrorCode::METHOD_NOT_FOUND, format!("not found: {what}"), None)
        }
        RoutingError::BackendUnavailable(id) => McpError::new(
            ErrorCode::INTERNAL_ERROR,
            format!("backend '{id}' is not connected"),
            None,
        ),
        RoutingError::Backend(e) => McpError::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None),
    }
}

fn malformed_response(e: serde_json::Error) -> McpError {
    McpError::new(
        ErrorCode::INTERNAL_ERROR,
        format!("malformed backend response: {e}"),
        None,
    )
}

/// A `RoutedTool`'s underlying `Tool` keeps the backend's own (unprefixed)
/// name; only the routing table key carries the external name. Rewrite it
/// here so clients see the same name they must call with.
fn external_tool(routed: &RoutedTool) -> Tool {
    let mut tool = routed.tool.clone();
    tool.name = routed.external_name.clone().into();
    tool
}

/// The client-facing MCP server. Constructed fresh per connection by the
/// `StreamableHttpService`/`SseServer` service-factory closures.
pub struct GatewayHandler {
    backend_manager: Arc<BackendManager>,
    sessions: Arc<SessionStore>,
    session_id: String,
    notifier_spawned: AtomicBool,
}

impl GatewayHandler {
    pub fn new(backend_manager: Arc<BackendManager>, sessions: Arc<SessionStore>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        sessions.track(session_id.clone());
        Self {
            backend_manager,
            sessions,
            session_id,
            notifier_spawned: AtomicBool::new(false),
        }
    }

    /// Forward the Backend Manager's "catalog changed" tick as the three MCP
    /// `list_changed` notifications (spec §4.2/§4.5). Spawned once per
    /// connection, the first time any request arrives with a usable peer.
    fn ensure_notifier(&self, peer: &Peer<RoleServer>) {
        if self.notifier_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = peer.clone();
        let mut changed = self.backend_manager.subscribe_catalog_changed();
        tokio::spawn(async move {
            while changed.recv().await.is_ok() {
                let _ = peer.notify_tool_list_changed().await;
                let _ = peer.notify_resource_list_changed().await;
                let _ = peer.notify_prompt_list_changed().await;
            }
        });
    }
}

impl ServerHandler for GatewayHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server aggregates tools, resources, and prompts from every connected \
                 backend MCP server behind one endpoint. Tool names may carry a backend-specific \
                 prefix (e.g. `fs_read_file`); call them exactly as listed by tools/list."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        self.ensure_notifier(&context.peer);
        async move {
            let tools = self
                .backend_manager
                .enabled_tools()
                .iter()
                .map(external_tool)
                .collect();
            Ok(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        self.ensure_notifier(&context.peer);
        self.sessions.touch(&self.session_id);
        let arguments = request.arguments.map(serde_json::Value::Object);
        async move {
            debug!(tool = %request.name, "dispatching tools/call");
            let value = self
                .backend_manager
                .call_tool(&request.name, arguments, None)
                .await
                .map_err(routing_error_to_mcp)?;
            serde_json::from_value(value).map_err(malformed_response)
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        self.ensure_notifier(&context.peer);
        async move {
            let resources: Vec<Resource> = self.backend_manager.all_resources();
            Ok(ListResourcesResult {
                meta: None,
                next_cursor: None,
                resources,
            })
        }
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        self.sessions.touch(&self.session_id);
        async move {
            let value = self
                .backend_manager
                .read_resource(&request.uri)
                .await
                .map_err(routing_error_to_mcp)?;
            serde_json::from_value(value).map_err(malformed_response)
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        self.ensure_notifier(&context.peer);
        async move {
            let prompts: Vec<Prompt> = self.backend_manager.all_prompts();
            Ok(ListPromptsResult {
                meta: None,
                next_cursor: None,
                prompts,
            })
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        self.sessions.touch(&self.session_id);
        async move {
            let value = self
                .backend_manager
                .get_prompt(&request.name, request.arguments)
                .await
                .map_err(routing_error_to_mcp)?;
            serde_json::from_value(value).map_err(malformed_response)
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HealthResponse {
    status: &'static str,
    backends: usize,
    tools: usize,
}

/// Liveness probe (spec §6 "grounded in the teacher's `admin::api::health`
/// handler"). Unlike the admin surface's richer per-backend listing, this
/// stays a flat summary so it is cheap enough to hit from a load balancer.
async fn healthz(axum::extract::State(backend_manager): axum::extract::State<Arc<BackendManager>>) -> axum::Json<HealthResponse> {
    let backends = backend_manager.list_info().await;
    let status = if backends.iter().all(|b| b.status == crate::backend::BackendStatus::Connected) {
        "ok"
    } else if backends.is_empty() {
        "ok"
    } else {
        "degraded"
    };
    axum::Json(HealthResponse {
        status,
        backends: backends.len(),
        tools: backend_manager.enabled_tools().len(),
    })
}

/// Build the client-facing router: Streamable HTTP at `/mcp` (primary
/// surface, spec §4.5), legacy SSE at `/sse` (spec §6 backward
/// compatibility), and a liveness probe at `/healthz`.
pub fn build_router(
    backend_manager: Arc<BackendManager>,
    sessions: Arc<SessionStore>,
    bind: SocketAddr,
    shutdown: CancellationToken,
) -> Router {
    let streamable_backend = Arc::clone(&backend_manager);
    let streamable_sessions = Arc::clone(&sessions);
    let streamable_service = StreamableHttpService::new(
        move || Ok(GatewayHandler::new(Arc::clone(&streamable_backend), Arc::clone(&streamable_sessions))),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let (sse_server, sse_router) = SseServer::new(SseServerConfig {
        bind,
        sse_path: "/sse".to_string(),
        post_path: "/sse/message".to_string(),
        ct: shutdown,
        sse_keep_alive: None,
    });
    let sse_backend = Arc::clone(&backend_manager);
    let sse_sessions = Arc::clone(&sessions);
    let _sse_ct = sse_server.with_service(move || GatewayHandler::new(Arc::clone(&sse_backend), Arc::clone(&sse_sessions)));

    let health_router = Router::new()
        .route("/healthz", get(healthz))
        .with_state(backend_manager);

    sse_router
        .nest_service("/mcp", streamable_service)
        .merge(health_router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_reports_ok_with_no_backends() {
        let backend_manager = BackendManager::new();
        let router = Router::new()
            .route("/healthz", get(healthz))
            .with_state(backend_manager);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.backends, 0);
        assert_eq!(parsed.tools, 0);
    }

    #[test]
    fn external_tool_rewrites_name_to_prefixed_form() {
        let routed = RoutedTool {
            external_name: "fs_read_file".to_string(),
            backend_id: "fs".to_string(),
            tool: rmcp::model::Tool {
                name: "read_file".into(),
                title: None,
                description: None,
                input_schema: Arc::new(serde_json::Map::new()),
                output_schema: None,
                annotations: None,
                icons: None,
            },
        };
        let tool = external_tool(&routed);
        assert_eq!(tool.name.as_ref(), "fs_read_file");
    }
}
