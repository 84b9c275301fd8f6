use anyhow::{Context, Result};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::ServiceExt;
use tracing::{info, warn};

use super::handler::GatewayClientHandler;
use super::lenient_client::LenientClient;
use crate::config::BackendConfig;

/// Complete the MCP handshake over the streamable-HTTP transport (spec §4.1
/// http variant): one POST per outgoing message, response body parsed as a
/// single JSON-RPC message, no server-initiated push.
pub async fn connect(
    id: &str,
    config: &BackendConfig,
    handler: GatewayClientHandler,
) -> Result<RunningService<rmcp::RoleClient, GatewayClientHandler>> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("http backend '{id}' missing url"))?;

    let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url);
    if let Some(auth) = config.headers.get("Authorization") {
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
        transport_config = transport_config.auth_header(token);
    }

    let mut default_headers = reqwest::header::HeaderMap::new();
    for (key, value) in &config.headers {
        if key.eq_ignore_ascii_case("Authorization") {
            continue;
        }
        match (
            key.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            (Ok(name), Ok(val)) => {
                default_headers.insert(name, val);
            }
            _ => warn!(backend = %id, header = %key, "skipping unparseable custom header"),
        }
    }

    let reqwest_client = reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .context("failed to build HTTP client")?;
    let client = LenientClient::new(reqwest_client);
    let transport = StreamableHttpClientTransport::with_client(client, transport_config);

    let service = handler.serve(transport).await.with_context(|| {
        format!("failed MCP handshake with http backend '{id}' at {url}")
    })?;

    if let Some(peer) = service.peer_info() {
        info!(
            backend = %id,
            url = %url,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "http handshake complete"
        );
    } else {
        info!(backend = %id, url = %url, "http handshake complete (no peer info)");
    }

    Ok(service)
}
