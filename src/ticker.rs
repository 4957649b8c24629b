use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::state::{SharedState, TickOutcome};

/// Periodic task that extrapolates the playback position between
/// notifications. At most one task runs at a time. The task ends once
/// playback stops or the estimate passes the end of the track.
pub struct ProgressTicker {
    period: Duration,
    task: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn new(period: Duration) -> Self {
        Self { period, task: None }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start ticking `state`. A no-op while a task is already running.
    pub fn start(&mut self, state: SharedState) {
        if self.is_running() {
            return;
        }

        let period = self.period;
        log::debug!("Starting progress ticker ({:?})", period);
        self.task = Some(tokio::spawn(async move {
            // First beat one period from now, not immediately.
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let outcome = state.write().tick();
                match outcome {
                    TickOutcome::Idle => break,
                    TickOutcome::Wrapped => {
                        log::debug!("Local position passed the end, reset to 0");
                        break;
                    }
                    TickOutcome::Advanced => {}
                }
            }
        }));
    }

    /// Cancel the running task, if any.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            log::debug!("Stopping progress ticker");
            task.abort();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
