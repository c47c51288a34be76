mod cli;
mod config;
mod error;
mod server;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::Relay;

use crate::cli::Cli;
use crate::error::ServerError;
use crate::server::SessionServer;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    init_tracing(cli.verbose);

    // Run and handle errors with proper exit codes
    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let path = cli.config.unwrap_or_else(config::config_path);
    let mut cfg = config::load_config(&path)?;

    // CLI flags override file values
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(token) = cli.auth_token {
        cfg.auth_token = Some(token);
    }

    let store = config::seed_store(&cfg)?;
    let relay = Relay::new(store);
    relay.start().await?;

    let cancel = CancellationToken::new();
    let listener = SessionServer::bind(cfg.listen, cfg.auth_token.clone()).await?;
    let mut serving = tokio::spawn(listener.serve(relay.clone(), cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        finished = &mut serving => {
            relay.shutdown().await;
            return match finished {
                Ok(result) => result,
                Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
            };
        }
    }

    cancel.cancel();
    if let Err(e) = serving.await {
        tracing::error!(error = %e, "listener task panicked");
    }
    relay.shutdown().await;
    Ok(())
}
