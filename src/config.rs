use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration (spec §6 "Environment", §3 BackendConfig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Idle window after which a client session is garbage-collected
    /// (spec §4.4).
    #[serde(default = "default_session_idle_timeout", with = "humantime_duration")]
    pub session_idle_timeout: Duration,

    /// `id -> BackendConfig`, keyed in memory for O(1) lookup. On disk this
    /// is the `servers: [BackendConfig, ...]` array spec §6 describes;
    /// `backends_as_servers` below converts between the two so that
    /// `Config::load` reads back exactly what `Config::save` writes.
    #[serde(default, rename = "servers", with = "backends_as_servers")]
    pub backends: HashMap<String, BackendConfig>,
}

/// (De)serialize `Config::backends` as a `servers:` array on the wire,
/// keyed by `BackendConfig::id` in memory. Keeping `Config` itself as the
/// single serde type (rather than a separate load-shape/save-shape pair)
/// is what guarantees `save` produces something `load` can read back.
mod backends_as_servers {
    use super::BackendConfig;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(
        backends: &HashMap<String, BackendConfig>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut servers: Vec<&BackendConfig> = backends.values().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, BackendConfig>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let servers: Vec<BackendConfig> = Vec::deserialize(deserializer)?;
        Ok(servers.into_iter().map(|b| (b.id.clone(), b)).collect())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_session_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Admin control-plane listener configuration (spec §4.6/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:9900".to_string()
}

/// Transport descriptor tagged union (spec §3/§4.1: stdio | http | sse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Http,
    Sse,
}

/// One backend's immutable configuration (spec §3 BackendConfig). `id` is
/// carried on the struct (in addition to being the `backends` map key) so a
/// `BackendConfig` is self-describing when it travels alone through the
/// admin `add`/`update`/`test`/export surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Lowercase alphanumeric + hyphen, unique.
    pub id: String,

    /// Human-readable display name, separate from `id`.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub transport: Transport,

    /// stdio only.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,

    /// http/sse only.
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Lowercase alphanumeric + underscore. Tools from this backend are
    /// exposed externally as `{tool_prefix}_{tool}` (spec §3 namespacing
    /// rule). Resources/prompts are never prefixed.
    #[serde(default)]
    pub tool_prefix: Option<String>,

    /// 1s–300s, default 30s.
    #[serde(default = "default_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// 0–5, applies only to the connect→initialize→list handshake.
    #[serde(default = "default_retries")]
    pub retries: u8,
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_retries() -> u8 {
    2
}

impl BackendConfig {
    /// Validate one entry against spec §3's shape constraints. Called on
    /// load and on every admin mutation (spec §6/§7 "validated on load and
    /// on every write").
    pub fn validate(&self) -> Result<()> {
        let valid_id = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_id {
            anyhow::bail!(
                "backend id '{}' must be lowercase alphanumeric + hyphen",
                self.id
            );
        }

        if let Some(prefix) = &self.tool_prefix {
            let valid_prefix = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid_prefix {
                anyhow::bail!(
                    "backend '{}': tool_prefix must be lowercase alphanumeric + underscore",
                    self.id
                );
            }
        }

        match self.transport {
            Transport::Stdio => {
                if self.command.is_none() {
                    anyhow::bail!("backend '{}': stdio transport requires 'command'", self.id);
                }
            }
            Transport::Http | Transport::Sse => {
                if self.url.is_none() {
                    anyhow::bail!("backend '{}': {:?} transport requires 'url'", self.id, self.transport);
                }
            }
        }

        if self.timeout < Duration::from_secs(1) || self.timeout > Duration::from_secs(300) {
            anyhow::bail!("backend '{}': timeout must be between 1s and 300s", self.id);
        }

        if self.retries > 5 {
            anyhow::bail!("backend '{}': retries must be between 0 and 5", self.id);
        }

        Ok(())
    }
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs != 0 && secs.is_multiple_of(60) {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("invalid duration '{s}': expected e.g. '30s', '5m', '1h'"))
        }
    }
}

impl Config {
    /// Read + env-interpolate + parse + validate (spec §6/§7: "malformed
    /// files refuse to start, with an explicit diagnostic"). `Config` is the
    /// sole on-disk shape (`log_level`/`host`/`port`/`admin`/
    /// `session_idle_timeout` alongside the `servers:` array), so whatever
    /// `save` below writes, `load` reads back unchanged.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for backend in self.backends.values() {
            backend.validate()?;
        }
        Ok(())
    }

    /// Persist to `path` atomically (write-temp + rename, spec §6/§9).
    /// Serializes the whole `Config`, the same shape `load` parses, so a
    /// save-then-load round-trips every setting, not just the backend set.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml_ng::to_string(self).context("failed to serialize config")?;
        atomic_write(path, yaml.as_bytes()).await
    }

    pub fn export_servers(&self) -> Vec<BackendConfig> {
        self.backends.values().cloned().collect()
    }
}

/// Write-temp-then-rename, reused for both the servers config file and the
/// UI-state (disable masks) file (spec §6/§9: "Both are written atomically").
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to rename temp file into {}", path.display()))?;
    Ok(())
}

/// Diff between old and new backend sets (spec §4.6 import `merge`,
/// and config hot-reload — §11 supplemented feature).
pub struct ConfigDiff {
    pub added: Vec<BackendConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<BackendConfig>,
}

impl Config {
    pub fn diff_backends(&self, new: &Config) -> ConfigDiff {
        let mut added = Vec::new();
        let mut changed = Vec::new();

        for (id, new_config) in &new.backends {
            match self.backends.get(id) {
                None => added.push(new_config.clone()),
                Some(old) if old != new_config => changed.push(new_config.clone()),
                _ => {}
            }
        }

        let removed = self
            .backends
            .keys()
            .filter(|id| !new.backends.contains_key(*id))
            .cloned()
            .collect();

        ConfigDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Watch the config file for external changes and apply the diff to the
/// Backend Manager (spec §11 supplemented feature, grounded in the
/// teacher's equivalent watcher). Debounced to coalesce rapid-fire editor
/// saves.
pub async fn watch_config(
    config_path: PathBuf,
    current_config: Arc<arc_swap::ArcSwap<Config>>,
    manager: Arc<crate::backend::BackendManager>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info, warn};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        error!(path = %config_path.display(), error = %e, "failed to watch config file");
        return;
    }

    info!(path = %config_path.display(), "config file watcher started");
    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("config file changed, reloading");
                let new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse new config, keeping current");
                        continue;
                    }
                };

                let old_config = current_config.load();
                let diff = old_config.diff_backends(&new_config);
                let has_changes = !diff.added.is_empty() || !diff.removed.is_empty() || !diff.changed.is_empty();

                if !has_changes {
                    current_config.store(Arc::new(new_config));
                    continue;
                }

                info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "applying config changes"
                );

                for id in &diff.removed {
                    if let Err(e) = manager.remove(id).await {
                        warn!(backend = %id, error = %e, "error removing backend");
                    }
                }
                for config in diff.changed.into_iter().chain(diff.added) {
                    let id = config.id.clone();
                    let result = if manager.get(&id).is_some() {
                        manager.update(&id, config).await
                    } else {
                        manager.add(config).await
                    };
                    if let Err(e) = result {
                        error!(backend = %id, error = %e, "failed to apply backend change");
                    }
                }

                current_config.store(Arc::new(new_config));
                info!("config reload complete");
            }
            _ = shutdown.notified() => {
                info!("config watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            timeout: default_timeout(),
            retries: default_retries(),
        }
    }

    #[test]
    fn parse_minimal_config() {
        let yaml = r#"
log_level: debug
servers:
  - id: fs
    transport: stdio
    command: echo
    args: ["hello"]
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        let backend = config.backends.get("fs").unwrap();
        assert_eq!(backend.transport, Transport::Stdio);
        assert_eq!(backend.command.as_deref(), Some("echo"));
    }

    #[test]
    fn parse_http_backend() {
        let yaml = r#"
servers:
  - id: svc
    transport: http
    url: "http://localhost:8080/mcp"
    headers:
      Authorization: "Bearer token123"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let backend = config.backends.get("svc").unwrap();
        assert_eq!(backend.transport, Transport::Http);
        assert_eq!(backend.url.as_deref(), Some("http://localhost:8080/mcp"));
    }

    /// The bug this guards against: `save` writing a shape `load` can't
    /// read back, silently dropping every persisted backend and setting on
    /// the next load (spec §4.6 persistence, §8 export/import round-trip).
    #[tokio::test]
    async fn save_then_load_round_trips_backends_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");

        let mut config = Config {
            log_level: "debug".to_string(),
            host: "0.0.0.0".to_string(),
            port: 4000,
            admin: AdminConfig::default(),
            session_idle_timeout: Duration::from_secs(900),
            backends: HashMap::new(),
        };
        config.backends.insert("fs".to_string(), stdio_backend("fs"));
        config.save(&path).await.unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.log_level, "debug");
        assert_eq!(reloaded.host, "0.0.0.0");
        assert_eq!(reloaded.port, 4000);
        assert_eq!(reloaded.session_idle_timeout, Duration::from_secs(900));
        assert_eq!(reloaded.backends.len(), 1);
        assert!(reloaded.backends.contains_key("fs"));
    }

    #[test]
    fn validate_rejects_stdio_missing_command() {
        let mut b = stdio_backend("broken");
        b.command = None;
        assert!(b.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_missing_url() {
        let mut b = stdio_backend("broken");
        b.transport = Transport::Http;
        assert!(b.validate().is_err());
    }

    #[test]
    fn validate_rejects_timeout_out_of_range() {
        let mut b = stdio_backend("x");
        b.timeout = Duration::from_secs(400);
        assert!(b.validate().is_err());
        b.timeout = Duration::from_millis(500);
        assert!(b.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_id() {
        let mut b = stdio_backend("Not_Valid!");
        b.id = "Not_Valid!".to_string();
        assert!(b.validate().is_err());
    }

    #[test]
    fn diff_detects_added_removed_changed() {
        let mut old = Config {
            log_level: default_log_level(),
            host: default_host(),
            port: default_port(),
            admin: AdminConfig::default(),
            session_idle_timeout: default_session_idle_timeout(),
            backends: HashMap::new(),
        };
        old.backends.insert("a".to_string(), stdio_backend("a"));
        old.backends.insert("b".to_string(), stdio_backend("b"));

        let mut new = Config {
            backends: HashMap::new(),
            ..clone_shell(&old)
        };
        let mut a_changed = stdio_backend("a");
        a_changed.args.push("--flag".to_string());
        new.backends.insert("a".to_string(), a_changed);
        new.backends.insert("c".to_string(), stdio_backend("c"));

        let diff = old.diff_backends(&new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "c");
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].id, "a");
    }

    fn clone_shell(c: &Config) -> Config {
        Config {
            log_level: c.log_level.clone(),
            host: c.host.clone(),
            port: c.port,
            admin: AdminConfig {
                enabled: c.admin.enabled,
                listen: c.admin.listen.clone(),
            },
            session_idle_timeout: c.session_idle_timeout,
            backends: HashMap::new(),
        }
    }

    #[test]
    fn diff_no_changes_when_identical() {
        let mut config = Config {
            log_level: default_log_level(),
            host: default_host(),
            port: default_port(),
            admin: AdminConfig::default(),
            session_idle_timeout: default_session_idle_timeout(),
            backends: HashMap::new(),
        };
        config.backends.insert("a".to_string(), stdio_backend("a"));
        let diff = config.diff_backends(&config);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
    }
}
