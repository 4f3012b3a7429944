use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotguard::config::Config;
use slotguard::engine::Engine;
use slotguard::notify::NotifyHub;
use slotguard::server::Server;
use slotguard::store::{LocalStore, Store};
use slotguard::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotguard::observability::init(config.metrics_port)?;

    let store = open_store(&config).await?;
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store, hub.clone()).with_section_timeout(config.section_timeout));
    tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotguard listening on {addr}");
    info!("  max_connections: {}", config.max_connections);
    info!("  token: {}", if config.token.is_some() { "required" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let server = Arc::new(Server::new(engine, hub, config.token.clone()));
    server.run(listener, config.max_connections, shutdown_signal()).await;

    info!("slotguard stopped");
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            let store = slotguard::store::PgStore::connect(url).await?;
            store.migrate().await?;
            info!("  ledger: postgres");
            return Ok(Arc::new(store) as Arc<dyn Store>);
        }
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.ledger_path();
    let store = Arc::new(LocalStore::open(&path)?);
    tokio::spawn(sweeper::run_compactor(
        store.clone(),
        config.compact_threshold,
        config.sweep_interval,
    ));
    info!("  ledger: {}", path.display());
    Ok(store as Arc<dyn Store>)
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
