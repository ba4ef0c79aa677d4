//! Digital Twin Backend - Main Entry Point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use twin_physics::{EngineConfig, PhysicsEngine};
use twin_server::broadcast::{BroadcastPool, SessionSet};
use twin_server::tick::run_tick_loop;
use twin_server::{bind_listener, create_router, init_logging, serve, AppState};

#[derive(Parser)]
#[command(
    name = "twin-server",
    about = "Real-time digital twin of a crankshaft-piston mechanism"
)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 3001)]
    port: u16,

    /// Tick period in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();

    info!("=== Crankshaft Digital Twin v{} ===", env!("CARGO_PKG_VERSION"));

    let engine = PhysicsEngine::new(EngineConfig::default());
    let sessions = Arc::new(SessionSet::new());
    let stop = Arc::new(AtomicBool::new(false));

    let state = Arc::new(AppState {
        controls: engine.controls(),
        sessions: Arc::clone(&sessions),
    });

    // Single-worker runtime: accept, upgrades, and every session task run
    // on one reactor thread. The main thread stays dedicated to the tick
    // loop and never enters the runtime after startup.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = runtime.block_on(bind_listener(&addr))?;

    let app = create_router(state);
    runtime.spawn(async move {
        if let Err(e) = serve(listener, app).await {
            error!(error = %e, "server error");
        }
    });
    runtime.spawn(shutdown_signal(Arc::clone(&stop)));

    info!("WebSocket server listening on ws://localhost:{}", args.port);
    info!("Health check: http://localhost:{}/health", args.port);

    run_tick_loop(
        engine,
        BroadcastPool::with_defaults(),
        Arc::clone(&sessions),
        Arc::clone(&stop),
        Duration::from_millis(args.tick_ms),
    );

    info!("Shutting down...");

    // Dropping every outbound sender ends every session task, which closes
    // the client sockets; the bounded runtime shutdown reaps the rest.
    sessions.clear();
    runtime.shutdown_timeout(Duration::from_secs(2));

    info!("Clean exit.");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives, then set the stop flag read by
/// the tick loop.
async fn shutdown_signal(stop: Arc<AtomicBool>) {
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    stop.store(true, Ordering::Relaxed);
}
