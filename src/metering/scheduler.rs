// Recovery scheduler - periodically settles jobs whose completion callback
// never arrived.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::recovery::RecoverySweep;

pub struct RecoveryScheduler {
    sweep: Arc<RecoverySweep>,
    every: Duration,
}

impl RecoveryScheduler {
    pub fn new(sweep: Arc<RecoverySweep>, every: Duration) -> Self {
        Self { sweep, every }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let sweep = self.sweep.clone();
        let every = self.every;

        tokio::spawn(async move {
            info!("⏰ Recovery sweep every {}s", every.as_secs());
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup isn't a sweep
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = sweep.run(None).await {
                    error!("❌ Recovery sweep failed: {}", e);
                }
            }
        })
    }
}
