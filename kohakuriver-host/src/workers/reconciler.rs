//! Periodic node/task reconciliation loop.

use crate::services::cluster::ClusterService;
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tracing::error;

pub struct ReconcilerWorker {
    cluster: Arc<ClusterService>,
    period: Duration,
}

impl ReconcilerWorker {
    pub fn spawn(cluster: Arc<ClusterService>, period: Duration) {
        tokio::spawn(async move {
            let worker = Self { cluster, period };
            worker.run().await;
        });
    }

    async fn run(self) {
        let mut ticker = interval(self.period);
        // If we miss a tick, shift the ticks to be aligned with when we called `Interval::tick`.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cluster.reconcile().await {
                error!("Reconciliation pass failed: {e}");
            }
        }
    }
}
