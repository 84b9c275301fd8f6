//! Routing tables and disable masks (spec §3 RoutingTables / DisableMasks, §4.3).
//!
//! A `RoutingTables` snapshot is rebuilt from scratch whenever a backend's
//! connection state or catalog changes, then published atomically via
//! `arc_swap::ArcSwap` so concurrent readers (the Protocol Handler, on every
//! `tools/list`/`tools/call`) never observe a torn table.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use rmcp::model::{Prompt, Resource, Tool};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BackendConfig;

/// One externally-visible tool entry, as produced by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedTool {
    pub external_name: String,
    pub backend_id: String,
    pub tool: Tool,
}

/// Snapshot of the three name→backend-id maps, rebuilt under a single writer.
#[derive(Debug, Default)]
pub struct RoutingTables {
    tools: HashMap<String, RoutedTool>,
    resources: HashMap<String, (String, Resource)>,
    prompts: HashMap<String, (String, Prompt)>,
}

impl RoutingTables {
    pub fn tool_backend(&self, external_name: &str) -> Option<&str> {
        self.tools.get(external_name).map(|r| r.backend_id.as_str())
    }

    pub fn resource_backend(&self, uri: &str) -> Option<&str> {
        self.resources.get(uri).map(|(id, _)| id.as_str())
    }

    pub fn prompt_backend(&self, name: &str) -> Option<&str> {
        self.prompts.get(name).map(|(id, _)| id.as_str())
    }

    pub fn tools(&self) -> impl Iterator<Item = &RoutedTool> {
        self.tools.values()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values().map(|(_, r)| r)
    }

    pub fn prompts(&self) -> impl Iterator<Item = &Prompt> {
        self.prompts.values().map(|(_, p)| p)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Rebuild the whole table from the given connected backends' catalogs and
    /// their prefixes, applying the first-wins collision policy (spec §4.3).
    ///
    /// `backends` is `(id, prefix, tools, resources, prompts)` for every
    /// backend currently in `Connected` state, iterated in a stable order
    /// (callers pass a `Vec` sorted by id so collisions are deterministic in
    /// tests).
    pub fn rebuild(
        backends: &[(
            String,
            Option<String>,
            Vec<Tool>,
            Vec<Resource>,
            Vec<Prompt>,
        )],
    ) -> Self {
        let mut tables = RoutingTables::default();

        for (id, prefix, tools, resources, prompts) in backends {
            for tool in tools {
                let external_name = external_tool_name(prefix.as_deref(), &tool.name);
                if tables.tools.contains_key(&external_name) {
                    warn!(
                        tool = %external_name,
                        backend = %id,
                        "tool name collision, second backend's tool hidden"
                    );
                    continue;
                }
                tables.tools.insert(
                    external_name.clone(),
                    RoutedTool {
                        external_name,
                        backend_id: id.clone(),
                        tool: tool.clone(),
                    },
                );
            }

            for resource in resources {
                let uri = resource.raw.uri.clone();
                if tables.resources.contains_key(&uri) {
                    warn!(resource = %uri, backend = %id, "resource uri collision, second backend's resource hidden");
                    continue;
                }
                tables.resources.insert(uri, (id.clone(), resource.clone()));
            }

            for prompt in prompts {
                if tables.prompts.contains_key(&prompt.name) {
                    warn!(prompt = %prompt.name, backend = %id, "prompt name collision, second backend's prompt hidden");
                    continue;
                }
                tables
                    .prompts
                    .insert(prompt.name.clone(), (id.clone(), prompt.clone()));
            }
        }

        tables
    }
}

/// Disabled tool/backend identifiers (spec §3 DisableMasks). Never a reason
/// to disconnect the underlying backend — it only filters the client-visible
/// catalog view built from `RoutingTables`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DisableMasks {
    pub disabled_tools: DashSetWrap,
    pub disabled_backends: DashSetWrap,
}

/// `DashSet<String>` does not implement `Serialize`/`Deserialize` directly;
/// this thin wrapper persists as a plain JSON array of strings.
#[derive(Debug, Default)]
pub struct DashSetWrap(pub Arc<DashSet<String>>);

impl DashSetWrap {
    pub fn contains(&self, v: &str) -> bool {
        self.0.contains(v)
    }

    pub fn insert(&self, v: String) {
        self.0.insert(v);
    }

    pub fn remove(&self, v: &str) {
        self.0.remove(v);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.iter().map(|r| r.clone()).collect()
    }
}

impl Serialize for DashSetWrap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DashSetWrap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let items: Vec<String> = Vec::deserialize(deserializer)?;
        let set = DashSet::new();
        for item in items {
            set.insert(item);
        }
        Ok(DashSetWrap(Arc::new(set)))
    }
}

/// Apply external-name prefixing for a single backend's configured prefix
/// (spec §3 Namespacing rule), used by `RoutingTables::rebuild` when it
/// publishes each connected backend's tools under their external names.
pub fn external_tool_name(prefix: Option<&str>, inner_name: &str) -> String {
    match prefix {
        Some(p) => format!("{p}_{inner_name}"),
        None => inner_name.to_string(),
    }
}

/// Strip a backend's configured prefix from an external tool name, returning
/// the inner name the backend itself recognizes. Returns `None` if the
/// external name does not carry this backend's prefix (should not happen for
/// names obtained via the routing table, but checked defensively).
pub fn strip_tool_prefix<'a>(config: &BackendConfig, external_name: &'a str) -> Option<&'a str> {
    match &config.tool_prefix {
        Some(p) => external_name.strip_prefix(&format!("{p}_")),
        None => Some(external_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{RawResource, Tool};
    use std::borrow::Cow;
    use std::sync::Arc as StdArc;

    fn tool(name: &str) -> Tool {
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: None,
            input_schema: StdArc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    #[test]
    fn rebuild_applies_prefix_and_first_wins_collision() {
        let a = (
            "a".to_string(),
            None,
            vec![tool("search")],
            vec![],
            vec![],
        );
        let b = (
            "b".to_string(),
            None,
            vec![tool("search")],
            vec![],
            vec![],
        );
        let tables = RoutingTables::rebuild(&[a, b]);
        assert_eq!(tables.tool_count(), 1);
        assert_eq!(tables.tool_backend("search"), Some("a"));
    }

    #[test]
    fn rebuild_applies_tool_prefix() {
        let fs = (
            "fs".to_string(),
            Some("fs".to_string()),
            vec![tool("read_file")],
            vec![],
            vec![],
        );
        let tables = RoutingTables::rebuild(&[fs]);
        assert_eq!(tables.tool_backend("fs_read_file"), Some("fs"));
        assert_eq!(tables.tool_backend("read_file"), None);
    }

    #[test]
    fn disable_mask_roundtrip_through_json() {
        let masks = DisableMasks::default();
        masks.disabled_tools.insert("fs_read_file".to_string());
        masks.disabled_backends.insert("fs".to_string());

        let json = serde_json::to_string(&masks).unwrap();
        let restored: DisableMasks = serde_json::from_str(&json).unwrap();
        assert!(restored.disabled_tools.contains("fs_read_file"));
        assert!(restored.disabled_backends.contains("fs"));
    }
}
