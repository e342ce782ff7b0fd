use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::state::SqsState;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically returns expired deliveries to their queues and redrives
/// exhausted messages to dead-letter queues.
pub struct Sweeper;

impl Sweeper {
    /// Intervals shorter than a millisecond are raised to one.
    pub fn start(state: Arc<SqsState>, interval: Duration) -> SweeperHandle {
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Visibility sweeper started");
            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        // A dropped sender counts as a stop request too.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let stats = state.sweep().await;
                        if stats.redriven > 0 || stats.retention_dropped > 0 {
                            debug!(
                                redriven = stats.redriven,
                                retention_dropped = stats.retention_dropped,
                                "Sweep finished"
                            );
                        }
                    }
                }
            }
            info!("Visibility sweeper stopped");
        });
        SweeperHandle { stop_tx, task }
    }
}

pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the sweeper and waits for it to exit. No queue is touched by
    /// the sweeper once this returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Visibility sweeper ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
