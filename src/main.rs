use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use parkd::config::Config;
use parkd::engine::{Engine, EngineOptions};
use parkd::{inventory, observability, sweeper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    let tls_acceptor = parkd::tls::acceptor(&config)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        EngineOptions {
            pricing: Arc::new(config.rates),
            lock: config.lock,
        },
    )?);

    if config.seed_inventory && engine.slots.is_empty() {
        let created = engine.provision_inventory(inventory::campus_layout()).await?;
        info!("seeded {created} slots from the campus layout");
    }

    if !config.sweep_interval.is_zero() {
        tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    }
    tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let credentials = config.credentials();

    let addr = config.address();
    let listener = TcpListener::bind(&addr).await?;
    info!("parkd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  slots: {}", engine.slots.len());
    info!("  max_connections: {max_connections}");
    info!("  admin user: {}", config.admin_user);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  sweeper: {}",
        if config.sweep_interval.is_zero() {
            "disabled".to_string()
        } else {
            format!("every {}s", config.sweep_interval.as_secs())
        }
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let credentials = credentials.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, credentials, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    engine.shutdown().await?;
    info!("parkd stopped");
    Ok(())
}
