//! Background sweep reclaiming dead and abandoned sessions.
//!
//! Every tick the reaper removes sessions whose process has exited, and —
//! when an idle threshold is configured — live sessions that have had no
//! activity and no attached viewers for longer than the threshold. A
//! session someone is still watching is never reaped, however quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use super::registry::SessionRegistry;

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    /// `None` disables idle reaping; dead-session cleanup still runs.
    idle_threshold: Option<Duration>,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        interval: Duration,
        idle_threshold: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            interval,
            idle_threshold,
        }
    }

    /// Run the sweep loop until the server shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_threshold_secs = self.idle_threshold.map(|t| t.as_secs()),
            "idle reaper started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.registry.sweep(self.idle_threshold).await;
            }
        })
    }
}
