//! Periodic keep-alive for the active device link

use std::sync::Arc;
use std::time::Duration;

use meshsync_core::transport::DeviceLink;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Heartbeat cadence of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Used while the device streams its configuration
    Configuring,
    /// Steady state once configured
    Steady,
}

/// A running heartbeat task
///
/// The task owns an `Arc` of the link and is aborted when the handle is
/// stopped or dropped, so it never outlives its session.
#[derive(Debug)]
pub struct Heartbeat {
    handle: JoinHandle<()>,
    interval: Duration,
    cadence: Cadence,
}

impl Heartbeat {
    /// Spawn a task calling `link.heartbeat()` every `interval`
    ///
    /// The first beat fires one interval after the start. Failures are logged
    /// and retried on the next tick.
    pub fn start(link: Arc<dyn DeviceLink>, interval: Duration, cadence: Cadence) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match link.heartbeat().await {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }
        });
        Self {
            handle,
            interval,
            cadence,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Abort the task
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
