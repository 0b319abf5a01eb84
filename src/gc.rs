//! Background quarantine garbage collection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lease::LeaseManager;

/// Periodically runs [`LeaseManager::garbage_collect_quarantine`].
///
/// A failed pass is logged and the next tick runs as usual. The task ends
/// when the shutdown channel carries `true` or its sender is dropped.
pub struct QuarantineCollector;

impl QuarantineCollector {
    pub fn spawn(
        manager: Arc<LeaseManager>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Quarantine GC running every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.garbage_collect_quarantine().await {
                            Ok(report) => debug!("Quarantine GC pass: {:?}", report),
                            Err(error) => warn!("Quarantine GC pass failed: {}", error),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Quarantine GC stopped");
        })
    }
}
