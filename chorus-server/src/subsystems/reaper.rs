//! Periodic deletion of expired messages and connection records.

use std::sync::Arc;

use chorus_core::config::ReaperConfig;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::store::{ConversationStore, StoreError};

pub async fn run_reaper_tick(store: &dyn ConversationStore) -> Result<u64, StoreError> {
    store.delete_expired(Utc::now().timestamp()).await
}

pub async fn run_reaper_loop(
    store: Arc<dyn ConversationStore>,
    config: ReaperConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if !config.enabled {
        tracing::info!("TTL reaper disabled via config");
        return;
    }

    let interval = tokio::time::Duration::from_secs(config.interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(interval_min = config.interval_minutes, "TTL reaper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_reaper_tick(store.as_ref()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Expired records deleted"),
                    Err(e) => tracing::warn!(error = %e, "TTL reaper tick failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("TTL reaper shutting down");
                break;
            }
        }
    }
}
