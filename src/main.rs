//! Hive 网关入口：加载配置、发现 agent、启动 HTTP 服务

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hive::config::load_config;
use hive::dedup::DedupCache;
use hive::registry::Registry;
use hive::server::{router, AppState};
use hive::store::create_thread_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 可选的配置文件路径：hive [config.toml]
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).map_err(|e| anyhow::anyhow!("config error: {}", e))?;
    tracing::info!(backends = config.backends.len(), "configuration loaded");

    let store = create_thread_store(config.store.db_path.as_deref()).await;
    let dedup = Arc::new(DedupCache::new(
        Duration::from_secs(config.dedup.sweep_secs),
        Duration::from_secs(config.dedup.reuse_secs),
    ));
    let registry = Arc::new(Registry::discover(
        config.clone(),
        Arc::clone(&store),
        dedup,
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        config: Arc::new(config),
        registry,
        store,
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("hive gateway listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
