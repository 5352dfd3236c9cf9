use tokio::time;
use tracing::{info, warn};

use crate::constants::BLOCK_PURGE_INTERVAL;
use crate::modules::persistence::store::Store;

/// Background jobs. Currently one: expired soft-block records are swept
/// every five minutes so the table cannot grow unbounded.
pub fn start_scheduler(store: Store) {
    tokio::spawn(async move {
        info!("[Scheduler] Block record cleanup job started");
        let mut interval = time::interval(BLOCK_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match store.purge_expired_block_records() {
                Ok(0) => {}
                Ok(purged) => info!("[Scheduler] Purged {} expired block records", purged),
                Err(e) => warn!("[Scheduler] Block record purge failed: {}", e),
            }
        }
    });
}
