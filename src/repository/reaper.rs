use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use crate::repository::RepositoryState;

/// Handle to the background task that removes expired messages. There is at most one live
///  reaper task per repository: it is started when a message with TTL is added and terminates
///  on its own when the TTL set is drained.
///
/// All methods are called with the TTL lock held, which serializes starting and stopping.
pub(super) struct Reaper {
    generation: u64,
    running: Option<RunningReaper>,
}

struct RunningReaper {
    generation: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn new() -> Reaper {
        Reaper {
            generation: 0,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts a reaper task unless one is running. A task that terminated without deregistering
    ///  itself died unexpectedly, and it is replaced.
    pub fn ensure_running(&mut self, state: &Arc<RepositoryState>) {
        if let Some(running) = &self.running {
            if !running.handle.is_finished() {
                return;
            }
            error!("TTL reaper (generation {}) terminated unexpectedly - restarting", running.generation);
        }

        self.generation += 1;
        let (cancel, cancel_receiver) = watch::channel(false);
        let handle = tokio::spawn(reap_loop(state.clone(), self.generation, cancel_receiver));

        self.running = Some(RunningReaper {
            generation: self.generation,
            cancel,
            handle,
        });
    }

    /// Requests cooperative termination: the task exits the next time it checks its cancel flag
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            debug!("stopping TTL reaper (generation {})", running.generation);
            let _ = running.cancel.send(true);
        }
    }

    /// Kills the running task without deregistering it, the way a panic would
    #[cfg(test)]
    pub fn abort(&self) {
        if let Some(running) = &self.running {
            running.handle.abort();
        }
    }

    /// Called by a reaper task that found the TTL set empty. A stale task from an earlier
    ///  generation must not deregister its successor.
    pub fn on_drained(&mut self, generation: u64) {
        if self.running.as_ref().map(|r| r.generation) == Some(generation) {
            self.running = None;
        }
    }
}

async fn reap_loop(state: Arc<RepositoryState>, generation: u64, mut cancel: watch::Receiver<bool>) {
    debug!("TTL reaper (generation {}) started", generation);

    loop {
        if *cancel.borrow() {
            debug!("TTL reaper (generation {}) cancelled", generation);
            return;
        }

        if state.sweep(Instant::now(), generation) {
            debug!("TTL set is drained - reaper (generation {}) terminates", generation);
            return;
        }

        select! {
            _ = time::sleep(state.reaper_interval) => {
                trace!("TTL reaper tick");
            }
            changed = cancel.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
