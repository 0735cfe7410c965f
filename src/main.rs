use anyhow::Context;
use hubsettle::gateway::{HttpHubGateway, RetryingGateway};
use hubsettle::orchestration::spawn_workers;
use hubsettle::{api, config::Config, db::init_db, HubGateway, Repository, Services};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .with_context(|| format!("initializing database at {}", config.database_path))?;
    let repo = Arc::new(Repository::new(pool));

    let http = HttpHubGateway::new(config.hub_api_url.clone(), config.hub_token_file.clone())
        .context("creating hub gateway")?;
    let gateway: Arc<dyn HubGateway> =
        Arc::new(RetryingGateway::new(Arc::new(http), config.gateway));

    let services = Services::build(repo.clone(), gateway, &config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&services, &config, shutdown_rx);

    let app = api::create_router(api::AppState::new(repo));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    tracing::info!(
        %addr,
        timezone = %config.market_timezone,
        vat_rate = %config.vat_rate,
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serving probes")?;

    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "worker ended abnormally");
        }
    }
    Ok(())
}
