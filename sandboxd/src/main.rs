//! Daemon entrypoint: wire the store, providers, container runtime, and
//! HTTP surface together, then serve until interrupted.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use redis::aio::ConnectionManager;
use sandbox_runtime::api::{self, AppState};
use sandbox_runtime::config::{Config, INIT_TIMEOUT};
use sandbox_runtime::{
    DockerRuntime, PgStore, PostgresProvider, ProviderRegistry, Reaper, RedisProvider,
    SandboxManager, SandboxStore, SessionManager, TemplateCatalog,
};
use sqlx::postgres::PgConnectOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load();
    info!(
        host = %config.server_host,
        port = config.server_port,
        "starting sandbox service"
    );

    // Store: pool + migrations, bounded by the init budget.
    let store = tokio::time::timeout(INIT_TIMEOUT, PgStore::connect(&config.database_dsn))
        .await
        .context("store initialization timed out")?
        .context("store initialization failed")?;
    let store = Arc::new(store);

    // Providers share the store's Postgres server; sandbox containers reach
    // it at the DSN's host/port.
    let pg_options =
        PgConnectOptions::from_str(&config.database_dsn).context("invalid DATABASE_DSN")?;
    let pg_host = pg_options.get_host().to_string();
    let pg_port = pg_options.get_port();

    let redis_client =
        redis::Client::open(config.redis_url()).context("invalid redis configuration")?;
    let redis_conn = tokio::time::timeout(INIT_TIMEOUT, ConnectionManager::new(redis_client))
        .await
        .context("redis initialization timed out")?
        .context("redis connection failed")?;

    let providers = Arc::new(ProviderRegistry::new());
    providers.register(Arc::new(PostgresProvider::new(
        store.pool().clone(),
        pg_host,
        pg_port,
    )));
    providers.register(Arc::new(RedisProvider::new(
        redis_conn,
        config.redis_host.clone(),
        config.redis_port,
        config.redis_password.clone(),
    )));

    let runtime = DockerRuntime::connect(config.container_runtime_host.as_deref())
        .await
        .context("container runtime connection failed")?;

    let catalog = TemplateCatalog::load_dir(&config.templates_dir)
        .context("loading template catalog failed")?;
    info!(templates = catalog.len(), dir = %config.templates_dir, "template catalog loaded");

    let shutdown = CancellationToken::new();
    let store_dyn: Arc<dyn SandboxStore> = store.clone();
    let manager = Arc::new(SandboxManager::new(
        store_dyn.clone(),
        providers,
        Arc::new(catalog),
        Arc::new(runtime),
        config.pull_policy,
        config.container_network.clone(),
        config.proxy.clone(),
        config.public_host.clone(),
        shutdown.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(store_dyn.clone(), manager.clone()));

    let reaper = Reaper::new(manager.clone(), sessions.clone(), config.cleanup_interval);
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

    let app = api::router(AppState {
        store: store_dyn.clone(),
        manager,
        sessions,
    });

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid server address")?;
    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("signal handler failed: {err}");
            }
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .context("server error")?;

    let _ = reaper_task.await;
    store_dyn.close().await;
    info!("shutdown complete");
    Ok(())
}
