mod admin;
mod config;

use anyhow::{bail, Context};
use clap::Parser;
use config::Args;
use esc_core::{RedactedUrl, RedactionPolicy};
use esc_relay::{spawn_relay_runtime, DeliveryWorker, EscalationIntake, EventBus, WebhookDispatcher};
use esc_storage::EscalationStore;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    let config = args.relay_config();

    let addr: SocketAddr = args
        .admin_addr
        .parse()
        .with_context(|| format!("invalid admin address {}", args.admin_addr))?;
    if !addr.ip().is_loopback() {
        bail!("admin address {addr} is not a loopback address");
    }

    if let Some(parent) = args.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    let store = Arc::new(
        EscalationStore::open(&args.db_path)
            .with_context(|| format!("open escalation store {}", args.db_path.display()))?,
    );

    let bus = EventBus::new();
    let (_intake, subscription) = EscalationIntake::subscribe(
        &bus,
        store.clone(),
        RedactionPolicy::default(),
        config.environment.clone(),
    );

    let dispatcher = WebhookDispatcher::new(
        config.webhook_url.clone(),
        Duration::from_millis(config.webhook_timeout_ms),
    )
    .context("build webhook client")?;
    match config.webhook_url.as_deref() {
        Some(url) => info!(event = "webhook_configured", url = %RedactedUrl(url)),
        None => warn!(event = "webhook_unconfigured"),
    }
    let webhook_configured = dispatcher.is_configured();

    let worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        Arc::new(dispatcher),
        &config,
    ));
    let runtime = spawn_relay_runtime(worker.clone(), &config);

    let app = admin::router(admin::AdminState {
        worker,
        bus,
        webhook_configured,
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind admin address {addr}"))?;

    info!(
        event = "relayd_start",
        addr = %addr,
        db_path = %args.db_path.display(),
        environment = %config.environment
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let clean = runtime
        .shutdown(Duration::from_millis(config.shutdown_grace_ms))
        .await;
    drop(subscription);
    info!(event = "relayd_stopped", clean);

    served.context("admin server failed")
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(event = "sigterm_handler_failed", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(event = "shutdown_requested");
}
