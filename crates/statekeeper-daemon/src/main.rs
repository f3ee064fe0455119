use anyhow::{Context, Result};
use log::{error, info};
use statekeeper_core::{
    approval::{ApprovalStore, SqliteApprovalRepository},
    config::{StatekeeperConfig, DEFAULT_CONFIG_PATH},
    drift::DriftDetector,
    logging,
    service::ReconcileService,
};
use statekeeper_system::{SambaShareProvider, SystemZfsProvider};
use std::sync::Arc;
use tokio::{net::TcpListener, signal, sync::watch};

mod api;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("statekeeperd", "info");
    let config_path =
        std::env::var("STATEKEEPER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(
        StatekeeperConfig::load(&config_path)
            .with_context(|| format!("load config {config_path}"))?,
    );

    info!(
        "statekeeper daemon booting (config: {config_path}, state: {})",
        config.state.path.display()
    );

    let zfs = SystemZfsProvider::from_config(&config).context("initialise zfs provider")?;
    let shares = SambaShareProvider::from_config(&config).context("open share registry")?;
    let repository = SqliteApprovalRepository::open(&config.database.path)
        .with_context(|| format!("open database {}", config.database.path.display()))?;
    let approvals = ApprovalStore::open(Box::new(repository)).context("load approvals")?;
    let service = Arc::new(ReconcileService::new(config.clone(), zfs, shares, approvals));

    // health status broadcast (true = converged or merely drifted, false = failing/blocked)
    let (health_tx, health_rx) = watch::channel(!config.drift.enabled);
    let detector = Arc::new(DriftDetector::new(
        service.clone(),
        Arc::new(api::HealthBroadcaster::new(health_tx)),
        config.drift_interval(),
    ));
    if config.drift.enabled {
        detector.start();
    } else {
        info!("drift detection disabled by configuration");
    }

    let app = api::router(api::AppState::new(service, detector.clone(), health_rx));
    let listener = TcpListener::bind(config.http.listen.as_str())
        .await
        .with_context(|| format!("bind {}", config.http.listen))?;
    info!("http api listening on http://{}", config.http.listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    detector.stop().await;
    info!("statekeeper daemon stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c; shutting down"),
        _ = terminate => info!("received SIGTERM; shutting down"),
    }
}
