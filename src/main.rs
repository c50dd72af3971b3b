use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use minerva::config::{self, FileConfigStore, ProxyConfig};
use minerva::metrics;
use minerva::namespace::Manager;
use minerva::session::Session;
use minerva::util::TimeoutWheel;

/// Connection ids start above the range low-numbered tools probe
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(10000);

/// How long to wait for in-flight sessions on shutdown
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_or_default_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    config
                        .log_level
                        .parse()
                        .unwrap_or_else(|_| Level::INFO.into()),
                )
                .from_env_lossy(),
        )
        .init();

    let store = FileConfigStore::new(&config.file_config_path);
    let namespaces = match store.load_all() {
        Ok(namespaces) => namespaces,
        Err(e) => {
            warn!(error = %e, path = %config.file_config_path, "no namespace definitions loaded");
            Vec::new()
        }
    };
    info!(
        cluster = %config.cluster,
        namespaces = namespaces.len(),
        "namespaces loaded"
    );

    let manager = Manager::new(&config.cluster, config.slow_sql_time_ms, &namespaces);
    if config.stats_enabled {
        manager.start_metrics_task(config.stats_interval_s);

        let metrics_addr = config.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    let timeout_wheel = TimeoutWheel::new();
    let session_timeout = Duration::from_secs(config.session_timeout_s);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "minerva proxy listening");

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(error = %e, "set_nodelay failed");
                }

                let connection_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let manager = manager.clone();
                let timeout_wheel = timeout_wheel.clone();

                info!(conn_id = connection_id, peer = %peer_addr, "new connection");

                sessions.spawn(async move {
                    let session = Session::new(
                        stream,
                        connection_id,
                        peer_addr.to_string(),
                        manager,
                        timeout_wheel,
                        session_timeout,
                    );
                    match session.run().await {
                        Ok(()) => info!(conn_id = connection_id, "session ended"),
                        Err(e) => warn!(conn_id = connection_id, error = %e, "session ended with error"),
                    }
                });
            }
        }
    }

    // drain in-flight sessions before disposing of the pools
    let active = sessions.len();
    if active > 0 {
        info!(
            active_sessions = active,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "waiting for active sessions"
        );
        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        loop {
            if sessions.is_empty() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = sessions.len(), "graceful shutdown timeout, aborting sessions");
                    sessions.abort_all();
                    break;
                }
                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }
    }

    manager.close();
    info!("minerva proxy shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> ProxyConfig {
    let config_paths = ["config/minerva.toml", "minerva.toml"];
    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                eprintln!("loaded configuration from {}", path);
                return config;
            }
            Err(_) => continue,
        }
    }
    ProxyConfig::default()
}
