//! A fixed set of tokio tasks that claim and dispatch runs.

use std::sync::Arc;
use std::time::Duration;

use everping_core::config::WorkerConfig;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;

/// Ceiling for the back-off after a failed claim.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker.max_workers` workers (at least one).
    pub fn start(dispatcher: Arc<Dispatcher>, config: &WorkerConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let count = config.max_workers.max(1);
        let handles = (0..count)
            .map(|id| {
                let dispatcher = Arc::clone(&dispatcher);
                let rx = rx.clone();
                tokio::spawn(worker_loop(id, dispatcher, poll, rx))
            })
            .collect();
        info!(workers = count, poll_ms = poll.as_millis() as u64, "worker pool started");
        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming and wait for every in-flight run to finish.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("worker task panicked: {e}");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    dispatcher: Arc<Dispatcher>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::ZERO;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let wait = match dispatcher.claim() {
            Ok(Some(run)) => {
                backoff = Duration::ZERO;
                let run_id = run.id;
                // Not raced against shutdown: an in-flight run always completes.
                if let Err(e) = dispatcher.dispatch(run).await {
                    error!(worker = id, %run_id, "cannot record run outcome: {e}");
                }
                continue;
            }
            Ok(None) => {
                backoff = Duration::ZERO;
                poll
            }
            Err(e) => {
                backoff = next_backoff(backoff, poll);
                warn!(worker = id, backoff_ms = backoff.as_millis() as u64, "claim failed: {e}");
                backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(worker = id, "worker stopped");
}

/// Double the previous back-off, starting from `base` and capped at [`MAX_BACKOFF`].
pub fn next_backoff(previous: Duration, base: Duration) -> Duration {
    (previous * 2).clamp(base.min(MAX_BACKOFF), MAX_BACKOFF)
}
