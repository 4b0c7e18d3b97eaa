use std::sync::Arc;

use localbridge::config::AppConfig;
use localbridge::logging::{self, LogRing};
use localbridge::manager::{InboundManager, OutboundManager, TranslateManager};
use localbridge::stats::StatsStore;

#[tokio::main]
async fn main() {
    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());
    let app_config = AppConfig::new(root);

    logging::init(LogRing::new());

    let stats = Arc::new(StatsStore::load(app_config.stats_path()));

    let translate_manager = TranslateManager::new(
        app_config.translate_dir(),
        app_config.transformers_dir(),
        stats.clone(),
    );
    let inbound_manager = InboundManager::new(stats.clone());
    let outbound_manager = OutboundManager::new(stats.clone());

    if let Err(e) = translate_manager.load_and_start().await {
        tracing::error!(error = %e, "failed loading translate channels");
    }
    if let Err(e) = inbound_manager.load_and_start(&app_config.inbound_dir()).await {
        tracing::error!(error = %e, "failed loading inbound channels");
    }
    if let Err(e) = outbound_manager.load_and_start(&app_config.outbound_dir()).await {
        tracing::error!(error = %e, "failed loading outbound channels");
    }

    tracing::info!("localbridge started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }

    tracing::info!("shutting down");
    translate_manager.stop_all().await;
    inbound_manager.stop_all().await;
    outbound_manager.stop_all().await;
}
