//! Connectivity-driven sync loop
//!
//! Runs a pass on every offline -> online transition, on explicit triggers
//! (a new message, a user retry) and every `syncIntervalSecs` while online.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sync::engine::SyncEngine;

/// Network reachability as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Handle to background sync tasks
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Receiver that flips to `true` on shutdown, for tasks attached later
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop all tasks; an in-flight pass finishes its current entry first
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Sync task ended abnormally: {}", e);
            }
        }
        tracing::info!("Sync scheduler stopped");
    }
}

impl SyncEngine {
    /// Start the background sync loop
    pub fn spawn(self: &Arc<Self>, connectivity: watch::Receiver<Connectivity>) -> SyncHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task = tokio::spawn(run_loop(engine, connectivity, shutdown_rx));

        SyncHandle {
            shutdown,
            tasks: vec![task],
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    mut connectivity: watch::Receiver<Connectivity>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(engine.config().sync_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = *connectivity.borrow_and_update();
    tracing::info!("Sync scheduler started ({:?})", last);

    loop {
        let run = tokio::select! {
            _ = shutdown.changed() => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    tracing::info!("Connectivity source closed");
                    break;
                }
                let now = *connectivity.borrow_and_update();
                let came_online = now == Connectivity::Online && last != Connectivity::Online;
                if now != last {
                    tracing::info!("Connectivity changed to {:?}", now);
                }
                last = now;
                came_online
            }
            _ = engine.trigger.notified() => last == Connectivity::Online,
            _ = interval.tick() => last == Connectivity::Online,
        };

        if run {
            let pass = engine.run_pass();
            tokio::pin!(pass);
            let finished = tokio::select! {
                result = &mut pass => Some(result),
                _ = shutdown.changed() => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    // No mid-flight cancellation: let the current entry finish
                    engine.request_stop();
                    pass.await
                }
            };
            if let Err(e) = result {
                tracing::warn!("Sync pass failed: {}", e);
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
}
