use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use tablet_messager::config::Settings;
use tablet_messager::messager::Engine;
use tablet_messager::schema::{SchemaChange, SchemaEngine, TableDescriptor};
use tablet_messager::server::{create_app, AppState};
use tablet_messager::storage::{PostgresMessageStore, PostgresPool};
use tablet_messager::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    telemetry::init_tracing(&settings.logging)?;
    tracing::info!("Configuration loaded");

    // Connect storage
    let pool = PostgresPool::new(&settings.database).await?;
    let store = Arc::new(PostgresMessageStore::new(pool.clone()));

    // Build the schema feed from the declared tables
    let schema = Arc::new(SchemaEngine::new(true));
    let tables = settings
        .tables
        .iter()
        .map(|table| TableDescriptor::from_config(table).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(tables = tables.len(), "Schema loaded");
    schema.apply(SchemaChange::created(tables, true)).await;

    // Start the message engine
    let engine = Engine::new(schema.clone(), store, settings.messager.clone());
    engine.open().await;

    // Create Axum app
    let state = AppState::new(settings.clone(), schema, engine.clone());
    let app = create_app(state);

    // Start server
    let addr = settings.admin_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Admin server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    tracing::info!("Closing message engine...");
    engine.close().await;
    pool.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
