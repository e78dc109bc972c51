use anyhow::Context;
use mapsync_server::{
    config::ServerConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    lease::{LeaseBackend, MemoryLeaseBackend, PgLeaseBackend},
    matchmaker::Matchmaker,
    snapshot::{MemorySnapshotRepo, PgSnapshotRepo, SnapshotRepo},
    store::YrsDocument,
    telemetry, ws,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    telemetry::init(&config.log_filter, config.log_format);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        host = %config.advertised_host,
        run_id = %config.run_id,
        "mapsync server listening"
    );

    match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize mapsync PostgreSQL pool")?;
            check_pool_health(&pool).await.context("mapsync PostgreSQL health check failed")?;
            run_migrations(&pool).await?;

            let matchmaker = Matchmaker::<YrsDocument, _, _>::new(
                config.matchmaker_config(),
                PgLeaseBackend::new(pool.clone()),
                PgSnapshotRepo::new(pool),
            );
            serve(listener, &config, matchmaker).await
        }
        None => {
            warn!("MAPSYNC_DATABASE_URL not set: single-instance mode, maps are kept in memory only");
            let matchmaker = Matchmaker::<YrsDocument, _, _>::new(
                config.matchmaker_config(),
                MemoryLeaseBackend::new(),
                MemorySnapshotRepo::new(),
            );
            serve(listener, &config, matchmaker).await
        }
    }
}

async fn serve<L, R>(
    listener: TcpListener,
    config: &ServerConfig,
    matchmaker: Matchmaker<YrsDocument, L, R>,
) -> anyhow::Result<()>
where
    L: LeaseBackend,
    R: SnapshotRepo,
{
    let app = ws::router(matchmaker.clone(), config.outbound_buffer);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Sessions flush and release their leases before the listener stops.
            matchmaker.shutdown().await;
        })
        .await
        .context("mapsync server exited unexpectedly")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
}
