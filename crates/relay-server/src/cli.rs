//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "obs-relay",
    about = "WebSocket relay bridging OBS instances and control-surface clients",
    version
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address override, e.g. 127.0.0.1:4456.
    #[arg(short, long, env = "RELAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Shared token control-surface clients must present on connect.
    #[arg(long, env = "RELAY_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
