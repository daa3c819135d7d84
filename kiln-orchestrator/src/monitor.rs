//! Status monitor
//!
//! Periodically refreshes every active service so statuses advance (and
//! tunnels open) without a client polling.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::service::ServiceManager;

/// Spawns the refresh loop; it runs until `token` is cancelled
pub fn spawn(
    services: Arc<ServiceManager>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    info!("Starting service monitor (interval: {:?})", interval);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match services.refresh_active().await {
                        Ok(0) => debug!("No active services"),
                        Ok(count) => debug!("Refreshed {} active service(s)", count),
                        Err(e) => error!("Error during monitor cycle: {:#}", e),
                    }
                }
            }
        }

        info!("Service monitor stopped");
    })
}
