use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use marquee::engine::{EngineConfig, ShiftAnchor};
use marquee::limits::DEFAULT_FALLBACK_DURATION_SECS;
use marquee::tenant::TenantManager;
use marquee::wire;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

/// Parse an optional variable, warning and falling back on garbage.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {key}={raw:?}");
            default
        }),
        Err(_) => default,
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        shift_anchor: env_parse("MARQUEE_SHIFT_ANCHOR", ShiftAnchor::default()),
        recheck_after_shift: env_parse("MARQUEE_RECHECK_AFTER_SHIFT", false),
        fallback_duration_secs: env_parse(
            "MARQUEE_FALLBACK_DURATION",
            DEFAULT_FALLBACK_DURATION_SECS,
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("MARQUEE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    marquee::observability::init(metrics_port);

    let port = env_or("MARQUEE_PORT", "5433");
    let bind = env_or("MARQUEE_BIND", "0.0.0.0");
    let data_dir = env_or("MARQUEE_DATA_DIR", "./data");
    let password = env_or("MARQUEE_PASSWORD", "marquee");
    let max_connections: usize = env_parse("MARQUEE_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_parse("MARQUEE_COMPACT_THRESHOLD", 1000);
    let config = engine_config();
    if config.fallback_duration_secs <= 0 {
        return Err("MARQUEE_FALLBACK_DURATION must be positive".into());
    }

    let tls_cert = std::env::var("MARQUEE_TLS_CERT").ok();
    let tls_key = std::env::var("MARQUEE_TLS_KEY").ok();
    let tls_acceptor = marquee::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
        config,
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("marquee listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  shift anchor: {:?}, recheck after shift: {}", config.shift_anchor, config.recheck_after_shift);
    info!("  fallback duration: {}s", config.fallback_duration_secs);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    let shutdown = shutdown_signal();
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

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(marquee::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(marquee::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(marquee::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(marquee::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);
    while semaphore.available_permits() < max_connections {
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("marquee stopped");
    Ok(())
}
