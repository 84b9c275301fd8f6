//! Persistence for the UI-state file: which tools/backends an operator has
//! manually disabled (spec §3 DisableMasks, §6 "UI-state file").
//!
//! Disabling a tool or backend here never disconnects it — it only hides it
//! from the client-visible catalog built from `RoutingTables` (spec §9).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::atomic_write;
use crate::routing::DisableMasks;

#[derive(Debug, Default, Serialize, Deserialize)]
struct UiStateFile {
    #[serde(default)]
    disabled_tools: Vec<String>,
    #[serde(default)]
    disabled_backends: Vec<String>,
}

/// Load the UI-state file if present. A missing file means nothing is
/// disabled yet, which is not an error.
pub async fn load(path: &Path) -> Result<DisableMasks> {
    let masks = DisableMasks::default();
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let file: UiStateFile = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse UI-state file: {}", path.display()))?;
            for tool in file.disabled_tools {
                masks.disabled_tools.insert(tool);
            }
            for backend in file.disabled_backends {
                masks.disabled_backends.insert(backend);
            }
            Ok(masks)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(masks),
        Err(e) => Err(e).with_context(|| format!("failed to read UI-state file: {}", path.display())),
    }
}

/// Persist the current masks atomically (write-temp + rename, same pattern
/// as the servers config file).
pub async fn save(path: &Path, masks: &DisableMasks) -> Result<()> {
    let file = UiStateFile {
        disabled_tools: masks.disabled_tools.snapshot(),
        disabled_backends: masks.disabled_backends.snapshot(),
    };
    let json = serde_json::to_string_pretty(&file).context("failed to serialize UI state")?;
    atomic_write(path, json.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty_masks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ui-state.json");
        let masks = load(&path).await.unwrap();
        assert!(masks.disabled_tools.snapshot().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ui-state.json");

        let masks = DisableMasks::default();
        masks.disabled_tools.insert("fs_read_file".to_string());
        masks.disabled_backends.insert("fs".to_string());
        save(&path, &masks).await.unwrap();

        let reloaded = load(&path).await.unwrap();
        assert!(reloaded.disabled_tools.contains("fs_read_file"));
        assert!(reloaded.disabled_backends.contains("fs"));
    }
}
