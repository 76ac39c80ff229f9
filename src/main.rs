use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_reconciler::config::AppConfig;
use order_reconciler::dispatch::{DeadLetterQueue, EventDispatcher, ScyllaJournal, Undelivered};
use order_reconciler::http::build_http_server;
use order_reconciler::metrics::Metrics;
use order_reconciler::reconciliation::ReconciliationEngine;
use order_reconciler::store::ScyllaOrderStore;
use order_reconciler::webhook::{PayloadNormalizer, SignatureVerifier, WebhookGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_reconciler=debug"))
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("🚀 Starting marketplace order reconciler");

    // === 1. Create ScyllaDB Session ===
    tracing::info!(nodes = ?config.scylla_nodes, "Connecting to ScyllaDB...");
    let session: Session = SessionBuilder::new()
        .known_nodes(&config.scylla_nodes)
        .build()
        .await?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.scylla_keyspace
            ),
            &[],
        )
        .await?;

    session.use_keyspace(&config.scylla_keyspace, false).await?;

    let session = Arc::new(session);

    let store = Arc::new(ScyllaOrderStore::new(session.clone()));
    store.ensure_schema().await?;
    let journal = Arc::new(ScyllaJournal::new(session.clone()));
    journal.ensure_schema().await?;

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 3. Reconciliation pipeline ===
    let engine = Arc::new(ReconciliationEngine::new(store, config.dispatcher.max_conflict_retries));
    let dispatcher = EventDispatcher::new(
        engine,
        journal,
        Arc::new(DeadLetterQueue::new()),
        metrics.clone(),
        config.dispatcher.clone(),
    );

    // Unfinished work from the previous run goes first
    if let Err(e) = dispatcher.recover().await {
        tracing::error!(error = %e, "Journal recovery incomplete, unrecovered entries stay journaled");
    }

    let gateway = Arc::new(WebhookGateway::new(
        SignatureVerifier::new(config.credentials.clone()),
        PayloadNormalizer::new(),
        dispatcher.clone(),
        metrics,
    ));

    // === 4. Serve webhooks until interrupted ===
    let server = build_http_server(gateway, config.http_port)?;
    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);

    tokio::select! {
        joined = &mut server_task => match joined {
            Ok(Ok(())) => tracing::warn!("HTTP server stopped on its own"),
            Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
            Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received, closing listener");
            server_handle.stop(true).await;
        }
    }

    // === 5. Drain ===
    match dispatcher.drain().await {
        Ok(()) => {}
        Err(Undelivered(events)) => {
            tracing::warn!(
                undelivered = events.len(),
                "⏳ Events remain journaled and will be replayed on next start"
            );
        }
    }

    let dead_letters = dispatcher.dead_letters().len().await;
    if dead_letters > 0 {
        tracing::warn!(dead_letters = dead_letters, "💀 Dead letters pending operator review");
    }

    tracing::info!("👋 Shutdown complete");
    Ok(())
}
