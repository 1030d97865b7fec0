//! Binary entrypoint: loads configuration, wires up the interactive and
//! (optional) background upstream connections, and serves the transport
//! router, tying together C1-C9 (spec §5, §6).

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ib_stream_gateway::app::AppState;
use ib_stream_gateway::config::{Cli, Config};
use ib_stream_gateway::transport;
use ib_stream_gateway::upstream::{FakeDriver, TwsDriver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let env_filter = cli
        .log_level
        .clone()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info,ib_stream_gateway=debug"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = cli.apply(Config::from_env());
    let bind_addr: SocketAddr = config.bind_addr.parse()?;

    // No production TWS socket driver ships with this crate; the wire
    // protocol that drives it (spec §1) is explicitly out of scope. FakeDriver
    // is the only TwsDriver this codebase implements and never produces real
    // market data — swapping in a real driver is the one remaining
    // integration point for a deployer who wants to point this at TWS. A
    // fresh instance per upstream connection, since each is its own session.
    let state = AppState::new(config, || Arc::new(FakeDriver::new()) as Arc<dyn TwsDriver>);
    state.spawn_tasks().await;

    let router = transport::build_router(state.clone());
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "ib_stream_gateway_listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    Ok(())
}

/// Waits for Ctrl+C (or SIGTERM on unix) and drains every in-flight
/// subscription so upstream `cancelTickByTickData` requests go out before the
/// process exits, rather than leaving them to the TWS-side idle timeout.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown_signal_received");
    state.stop_all_client_streams().await;
    if let Some(bg) = &state.background {
        bg.shutdown();
    }
}
