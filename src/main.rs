// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use vless_rs::config::{CliArgs, ConnConfig};
use vless_rs::core::{Identity, RelayContext, SessionRegistry};
use vless_rs::logger::{self, log, LogLevel};
use vless_rs::server_runner;

/// Grace period for sessions to tear down after a shutdown signal
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                log::warn!("Failed to install signal handlers, falling back to ctrl-c");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments; an invalid identity stops the process here
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(LogLevel::parse(&cli.log_mode));

    let identity = Identity::parse(&cli.uuid)?;
    let listen_addr = cli.listen_addr()?;
    let shutdown = CancellationToken::new();

    let ctx = Arc::new(
        RelayContext::builder()
            .identity(identity)
            .egress(cli.egress_hint()?)
            .dns_upstream(cli.dns_upstream()?)
            .ws_path(cli.ws_path.clone())
            .registry(SessionRegistry::with_shutdown(shutdown.child_token()))
            .conn_config(ConnConfig::from_cli(&cli))
            .build()
            .context("Failed to build relay context")?,
    );

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %listen_addr,
        "Starting VLESS relay"
    );

    let shutdown_signal = shutdown.clone();
    let registry = ctx.registry.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!(
            active_sessions = registry.active_count(),
            "Cancelling live sessions"
        );
        shutdown_signal.cancel();
    });

    server_runner::run_server(Arc::clone(&ctx), listen_addr, shutdown).await?;

    // Give cancelled sessions a moment to close their transports
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    log::info!(active_sessions = ctx.registry.active_count(), "Shutdown complete");
    Ok(())
}
