use std::sync::Arc;

use tracing::info;

use lessonbook::config::Config;
use lessonbook::engine::Engine;
use lessonbook::notify::NotifyHub;
use lessonbook::store::PgStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    lessonbook::observability::init(config.metrics_port)?;

    let store = PgStore::connect(&config).await?;
    store.migrate().await?;
    info!("  max_connections: {}", config.db_max_connections);
    info!("  acquire_timeout: {:?}", config.db_acquire_timeout);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(Arc::new(store), hub);

    let pending = engine.verdict_pending_lessons().await?;
    info!(lessons = pending.len(), "awaiting verdict");

    info!("lessonbook ready");
    Ok(())
}
