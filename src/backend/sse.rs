use anyhow::{Context, Result};
use rmcp::service::RunningService;
use rmcp::transport::sse_client::{SseClientTransport, SseClientConfig};
use rmcp::ServiceExt;
use tracing::{info, warn};

use super::handler::GatewayClientHandler;
use crate::config::BackendConfig;

/// Complete the MCP handshake over the SSE transport (spec §4.1 sse variant):
/// a long-lived GET delivers server-sent `data:` frames as incoming JSON-RPC
/// messages, outgoing messages go via a companion POST, same as the http
/// variant's request side.
pub async fn connect(
    id: &str,
    config: &BackendConfig,
    handler: GatewayClientHandler,
) -> Result<RunningService<rmcp::RoleClient, GatewayClientHandler>> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("sse backend '{id}' missing url"))?;

    let mut default_headers = reqwest::header::HeaderMap::new();
    for (key, value) in &config.headers {
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
        .context("failed to build HTTP client for sse transport")?;

    let transport = SseClientTransport::start_with_client(
        reqwest_client,
        SseClientConfig {
            sse_endpoint: url.to_string().into(),
            ..Default::default()
        },
    )
    .await
    .with_context(|| format!("failed to open sse stream for backend '{id}' at {url}"))?;

    let service = handler.serve(transport).await.with_context(|| {
        format!("failed MCP handshake with sse backend '{id}' at {url}")
    })?;

    if let Some(peer) = service.peer_info() {
        info!(
            backend = %id,
            url = %url,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "sse handshake complete"
        );
    } else {
        info!(backend = %id, url = %url, "sse handshake complete (no peer info)");
    }

    Ok(service)
}
