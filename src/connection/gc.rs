//! Background Garbage Collector
//!
//! Periodically reclaims idle physical connections whose TTL has elapsed.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::manager::ManagerInner;

pub(super) struct GarbageCollector {
    handle: JoinHandle<()>,
}

impl GarbageCollector {
    /// Spawn the sweep loop. It holds only a weak reference to the manager
    /// and stops on the shutdown signal or once the manager is gone.
    pub(super) fn spawn(
        manager: Weak<ManagerInner>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            info!(?interval, "Garbage collector started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        debug!("Garbage collector received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        let purged = manager.garbage_collect(false).await;
                        if purged > 0 {
                            debug!(purged, "Garbage collector purged idle physical connections");
                        }
                    }
                }
            }

            info!("Garbage collector stopped");
        });

        Self { handle }
    }

    /// Wait for the loop to finish after shutdown has been signalled
    pub(super) async fn join(self) {
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Garbage collector task failed: {}", e);
            }
        }
    }
}
