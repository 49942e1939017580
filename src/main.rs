use beacon::config::BeaconConfig;
use beacon::scheduler::Scheduler;
use beacon::server::{self, AppState};
use beacon::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Beacon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // 2. Load Configuration
    let config = BeaconConfig::load()?;
    config.validate()?;

    if config.server.api_key.is_none() {
        warn!("server.api_key not set, the command API is open to anyone who can reach it");
    }

    // 3. Wire the synchronizer and scheduler
    let synchronizer = Arc::new(config.build_synchronizer()?);
    let tracked = synchronizer.registry().len().await;
    info!(tracked, "Destination registry loaded");

    let shutdown = ShutdownSignal::new();
    let scheduler = Scheduler::new(synchronizer.clone(), config.schedule_policy()?);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    // 4. Build Router
    let app = server::router(Arc::new(AppState {
        synchronizer,
        api_key: config.server.api_key.clone(),
    }));

    // 5. Start Server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Beacon listening on {}", addr);

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.listen().await });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.triggered().await })
        .await?;

    // The server only returns once shutdown began; give the scheduler its
    // grace period to unwind.
    match tokio::time::timeout(shutdown.grace_period(), scheduler_task).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Scheduler task failed"),
        Err(_) => warn!("Scheduler did not stop within the grace period"),
    }

    Ok(())
}
