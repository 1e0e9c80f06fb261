//! Background-loop supervision and orderly shutdown.
//!
//! Every long-lived loop (poller, push stream, sweeper, sync) is spawned
//! through the scheduler and observes the same root cancellation token.
//! Shutdown cancels the token once and then waits, bounded, for the loops
//! to drain.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The root cancellation token every loop must observe.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "starting background loop");
        self.tasks.push((name, tokio::spawn(future)));
    }

    /// Install a ctrl-c handler that trips the root token.
    pub fn cancel_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    /// Cancel and wait for every loop, each bounded by `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!(task = name, "background loop stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "background loop panicked"),
                Err(_) => warn!(task = name, "background loop did not stop in time"),
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_spawned_loops() {
        let mut scheduler = Scheduler::new();
        let token = scheduler.token();
        scheduler.spawn("ticker", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    _ = token.cancelled() => return,
                }
            }
        });
        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
