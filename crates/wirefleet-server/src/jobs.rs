//! Background jobs for the Wirefleet server

use std::sync::Arc;
use std::time::Duration;

use crate::cache::StatusCache;
use crate::metrics;

/// Drop expired status snapshots and refresh the cache gauge
pub fn sweep_status_cache(cache: &dyn StatusCache) -> usize {
    let purged = cache.purge_expired();
    metrics::set_cache_entries(cache.len());

    if purged > 0 {
        tracing::debug!("Purged {} expired status snapshots", purged);
    }
    purged
}

/// Run the cache sweep forever on a fixed interval
pub fn spawn_cache_sweep(cache: Arc<dyn StatusCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            sweep_status_cache(cache.as_ref());
        }
    })
}
