//! Recurring background sync.

use crate::engine::SyncEngine;
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Shortest period the scheduler accepts.
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Owns at most one background task.
#[derive(Default)]
pub(crate) struct Scheduler {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Returns true while the task is alive.
    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the task on the current runtime.
    ///
    /// Returns `Ok(false)` if a task is already running.
    pub(crate) fn start(&self, engine: Weak<SyncEngine>, period: Duration) -> EngineResult<bool> {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        *slot = Some(runtime.spawn(run(engine, period.max(MIN_PERIOD))));
        Ok(true)
    }

    /// Aborts the task. Returns true if one was running.
    pub(crate) fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                was_running
            }
            None => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run(engine: Weak<SyncEngine>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            debug!("engine dropped, background sync exiting");
            break;
        };
        engine.background_tick().await;
    }
}
