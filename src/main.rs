// LOCUS relay - main entry point
// Copyright (C) 2024 - LOCUS relay authors
// Licensed under AGPL v3

use anyhow::Context;
use clap::Parser;
use locus_relay::broker::Broker;
use locus_relay::config::Config;
use locus_relay::net::http::router;
use locus_relay::net::listener::TcpServer;
use locus_relay::relay::{Downstream, HttpDownstream};
use locus_relay::store::{JsonLinesStore, LocationStore, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(config.verbose);

    info!("Starting LOCUS relay");

    let broker_config = config.broker_config().context("invalid reference point")?;
    info!(
        latitude = broker_config.reference.latitude,
        longitude = broker_config.reference.longitude,
        mode = ?broker_config.filter.mode,
        "Reference point"
    );

    let store: Arc<dyn LocationStore> = match &config.store_file {
        Some(path) => {
            let store = JsonLinesStore::open(path)
                .await
                .with_context(|| format!("cannot open store file {}", path.display()))?;
            info!("Persisting records to {}", path.display());
            Arc::new(store)
        }
        None => {
            warn!("No --store-file given, records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let downstream: Option<Arc<dyn Downstream>> = match &config.backend_url {
        Some(url) => Some(Arc::new(HttpDownstream::new(url.clone(), BACKEND_TIMEOUT)?)),
        None => {
            info!("No backend URL configured, downstream relay disabled");
            None
        }
    };

    let broker = Arc::new(Broker::new(broker_config, store, downstream));
    match broker.restore().await {
        Ok(0) => {}
        Ok(restored) => info!(restored, "Restored recent locations from storage"),
        Err(e) => warn!("Could not restore recent locations: {}", e),
    }
    broker.start();

    // 1. Line-JSON TCP listeners
    let mut servers: Vec<TcpServer> = Vec::new();
    for addr in &config.tcp_listen {
        match TcpServer::start(*addr, broker.clone()).await {
            Ok(server) => servers.push(server),
            Err(e) => error!("Failed to start TCP server on {}: {}", addr, e),
        }
    }

    // 2. WebSocket + HTTP
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.listen))?;
    info!("WebSocket and HTTP on {}", listener.local_addr()?);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let app = router(broker.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let mut http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    info!("Relay ready");

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("unable to listen for shutdown signal")?;
            info!("Received shutdown signal (Ctrl+C)");
        }
        result = &mut http => {
            // Server ended on its own; still shut the broker down cleanly
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    }

    info!("Shutting down...");
    // Stop accepting first; sessions that still slip in are turned away by the broker
    for mut server in servers {
        server.shutdown().await;
    }
    let _ = stop_tx.send(());
    broker.shutdown().await;

    let grace = config.shutdown_grace();
    if !http.is_finished() && tokio::time::timeout(grace, &mut http).await.is_err() {
        warn!("Connections still open after {:?}, forcing exit", grace);
        http.abort();
    }

    let stats = broker.stats().snapshot();
    info!(
        published = stats.records_published,
        persisted = stats.records_persisted,
        connections = stats.total_connections,
        "Relay stopped"
    );
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
