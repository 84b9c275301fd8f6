use rmcp::model::*;
use rmcp::service::NotificationContext;
use rmcp::{ClientHandler, RoleClient};
use tokio::sync::mpsc::UnboundedSender;

use super::BackendEvent;

/// Client-role handler passed to `rmcp::ServiceExt::serve` for every backend
/// connection. Its only job is translating the server's `list_changed`
/// notifications into `BackendEvent`s the Backend Manager can react to
/// (spec §4.2: "notification `notifications/tools/list_changed` ... →
/// reissue the relevant `*/list`"). Everything else uses rmcp's defaults.
#[derive(Clone)]
pub struct GatewayClientHandler {
    pub backend_id: String,
    pub events: UnboundedSender<(String, BackendEvent)>,
}

impl GatewayClientHandler {
    pub fn new(backend_id: String, events: UnboundedSender<(String, BackendEvent)>) -> Self {
        Self { backend_id, events }
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send((self.backend_id.clone(), event));
    }
}

impl ClientHandler for GatewayClientHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.emit(BackendEvent::ToolsChanged);
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.emit(BackendEvent::ResourcesChanged);
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.emit(BackendEvent::PromptsChanged);
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo::default()
    }
}
