//! Server error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use relay_core::RelayError;

/// Exit codes for process termination.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const BIND: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("Could not bind listener to {addr}")]
    #[diagnostic(
        code(relay::bind_failed),
        help(
            "Check that the address is free and routable.\n\
             Override it with --listen or the RELAY_LISTEN environment variable."
        )
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error")]
    #[diagnostic(
        code(relay::config),
        help("Check the configuration file, or point at another one with --config.")
    )]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(relay::core))]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bind { .. } => exit_code::BIND,
            Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}
