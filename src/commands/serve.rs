use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use packplane::admin_api::{AdminState, build_router};
use packplane::config::Config;
use packplane::metrics;
use packplane::orchestrator::Orchestrator;

/// Run the control plane and the admin HTTP surface until Ctrl+C.
pub async fn run(config_path: Option<&Path>, addr_override: Option<String>) -> Result<()> {
    println!("Starting packplane control plane...\n");

    let mut config = Config::load(config_path).context("Failed to load configuration")?;
    if let Some(addr) = addr_override {
        config.admin_addr = addr;
    }

    metrics::force_init();

    let addr: std::net::SocketAddr = config
        .admin_addr
        .parse()
        .with_context(|| format!("Invalid admin address {:?}", config.admin_addr))?;

    let orchestrator = Orchestrator::new(config.clone()).context("Failed to build control plane")?;
    orchestrator.start();

    let mode = if config.production_mode {
        "production (chaos locked out)"
    } else if config.chaos_permitted() {
        "chaos enabled"
    } else {
        "chaos available, not enabled"
    };

    println!("  Mode ........................ {mode}");
    println!("  Scheduling policy ........... {:?}", config.scheduling_policy);
    println!(
        "  Heartbeat timeout / lease ... {}s / {}s",
        config.heartbeat_timeout_ms / 1000,
        config.lease_timeout_ms / 1000
    );
    println!(
        "  Loop intervals .............. schedule {}s, reconcile {}s, health {}s",
        config.schedule_interval_ms / 1000,
        config.reconcile_interval_ms / 1000,
        config.health_check_interval_ms / 1000
    );
    println!("  Admin server ................ http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET  /healthz ............. Liveness probe (always 200 OK)");
    println!("    GET  /readyz .............. Readiness probe (503 until started, then 200)");
    println!("    GET  /metrics ............. Prometheus metrics scrape endpoint");
    println!("    POST /chaos/enable ........ Chaos surface (403 in production)");
    println!("    GET  /scenarios ........... Declarative chaos scenarios");
    println!();
    println!("Control plane running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("serve_started");

    let state = AdminState::new(orchestrator.clone());
    state.ready.store(true, Ordering::SeqCst);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut http_shutdown = shutdown_tx.subscribe();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin server on {addr}"))?;

    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping control plane...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    orchestrator.shutdown().await;
    let _ = http_handle.await?;

    info!("serve_stopped");
    println!("Control plane stopped.");
    Ok(())
}
