use std::process::Stdio;

use anyhow::{Context, Result};
use rmcp::service::RunningService;
use rmcp::ServiceExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::handler::GatewayClientHandler;
use crate::config::BackendConfig;

/// Spawn the configured command and complete the MCP handshake over its
/// stdio pipes (spec §4.1 stdio variant). The child is kept separately from
/// the `RunningService` so the reaper task in `BackendConnection` can await
/// its exit independently of rmcp's own transport lifecycle.
pub async fn connect(
    id: &str,
    config: &BackendConfig,
    handler: GatewayClientHandler,
) -> Result<(RunningService<rmcp::RoleClient, GatewayClientHandler>, Child)> {
    let command = config
        .command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("stdio backend '{id}' missing command"))?;

    let mut cmd = Command::new(command);
    if !config.args.is_empty() {
        cmd.args(&config.args);
    }
    // Merge over the inherited environment, never replace it (spec §9).
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn backend '{id}'"))?;

    let pid = child.id();
    debug!(backend = %id, pid = ?pid, "spawned child process");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture stdout from backend '{id}'"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture stdin from backend '{id}'"))?;

    let service = handler.serve((stdout, stdin)).await.with_context(|| {
        kill_orphan(&mut child, pid);
        format!("failed MCP handshake with backend '{id}'")
    })?;

    if let Some(peer) = service.peer_info() {
        info!(
            backend = %id,
            pid = ?pid,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "stdio handshake complete"
        );
    } else {
        info!(backend = %id, pid = ?pid, "stdio handshake complete (no peer info)");
    }

    Ok((service, child))
}

/// Best-effort cleanup if the handshake itself fails after spawn.
fn kill_orphan(child: &mut Child, pid: Option<u32>) {
    warn!(pid = ?pid, "handshake failed, killing orphaned child");
    let _ = child.start_kill();
}

/// Send SIGTERM to the child's process group, wait briefly, then hard kill
/// (spec §9: "children must be killed on parent shutdown with escalation").
pub async fn kill_child(id: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: libc::kill is safe to call with any PID value.
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if ret == 0 {
            debug!(backend = %id, pid, "sent SIGTERM to process group");
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        } else {
            warn!(backend = %id, pid, "failed to signal process group, killing child directly");
        }
    }
    let _ = child.kill().await;
}
