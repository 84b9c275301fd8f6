use clap::Parser;
use std::path::PathBuf;

/// Command-line surface for the gateway process. Almost everything else is
/// configured through the servers config file (spec §6 "Environment"); the
/// flags here exist for the handful of things an operator wants to override
/// without editing that file (where to bind, how noisy to log).
#[derive(Parser)]
#[command(
    name = "mcp-aggregate-gateway",
    version,
    about = "MCP gateway that aggregates backend MCP servers behind a single client-facing endpoint"
)]
pub struct Cli {
    /// Path to the servers config file.
    #[arg(short, long, default_value = "config/gateway.yaml")]
    pub config: PathBuf,

    /// Path to the UI-state file (disabled tools/backends). Defaults to a
    /// sibling of the config file.
    #[arg(long)]
    pub ui_state: Option<PathBuf>,

    /// Override the config file's `log_level`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the config file's client-facing `host:port`.
    #[arg(long)]
    pub listen: Option<String>,
}
