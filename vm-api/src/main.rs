use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use vm_api::{create_app, AppState, Config};
use vm_gateway::{GatewayProvider, SettingsGateways, YamlSettingsFile};
use vm_logging::{init_subscriber, LogSettings};
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vm_orchestrator::{Catalog, ProvisioningService};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env());

    info!("Starting vm-api service...");

    let config = Config::from_env();
    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        settings_path = %config.settings_path.display(),
        default_workers = config.default_workers,
        "Configuration loaded"
    );

    // Backup before migrations
    if let Some(backup_path) = backup_database(&config.db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => Catalog::default(),
    };

    let gateways: Arc<dyn GatewayProvider> = Arc::new(SettingsGateways::new(
        YamlSettingsFile::new(config.settings_path.clone()),
    ));
    match gateways.environments() {
        Ok(environments) => info!(count = environments.len(), "Environments configured"),
        Err(e) => warn!(error = %e, "Gateway settings unreadable, environments unavailable"),
    }

    let service = ProvisioningService::new(pool, catalog, gateways, config.service_config());

    if config.reconcile_on_start {
        let report = service.reconcile().await?;
        info!(
            requests = report.requests,
            deployments = report.deployments,
            "Resumed interrupted work"
        );
    }

    let app = create_app(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Runs still in flight are resumed by the next start's reconcile.
    info!("vm-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
