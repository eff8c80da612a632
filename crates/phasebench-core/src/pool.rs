use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::probe::ProbeFactory;
use crate::store::MetricsStore;
use crate::worker::{run_worker, WorkerExit};

/// How the workers of one phase ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub stopped: usize,
    pub superseded: usize,
    pub probe_failed: usize,
    pub panicked: usize,
}

/// Fixed-size group of workers loading one target for one phase.
pub struct WorkerPool {
    store: Arc<MetricsStore>,
    target: Arc<str>,
    epoch: u64,
    handles: Vec<JoinHandle<WorkerExit>>,
}

impl WorkerPool {
    /// Register and start `workers` workers for `epoch`.
    ///
    /// Registration happens before any task is spawned, so a drain can never
    /// see an empty pool while workers are still starting up.
    pub fn spawn(
        store: &Arc<MetricsStore>,
        target: &str,
        epoch: u64,
        workers: usize,
        probes: Arc<dyn ProbeFactory>,
    ) -> Self {
        let target: Arc<str> = Arc::from(target);
        let guards: Vec<_> = (0..workers).map(|_| store.register_worker(epoch)).collect();

        let handles = guards
            .into_iter()
            .enumerate()
            .map(|(id, guard)| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&target),
                    guard,
                    Arc::clone(&probes),
                ))
            })
            .collect();

        info!("Spawned {} workers against {}", workers, target);
        Self {
            store: Arc::clone(store),
            target,
            epoch,
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ask every worker to finish after its current request.
    pub fn stop(&self) {
        self.store.raise_stop(self.epoch);
    }

    /// Block until every worker has exited, or fail after `timeout`.
    pub async fn drain(self, timeout: Duration) -> Result<DrainSummary> {
        self.store.drain_wait(timeout).await?;

        let mut summary = DrainSummary::default();
        for joined in join_all(self.handles).await {
            match joined {
                Ok(WorkerExit::Stopped) => summary.stopped += 1,
                Ok(WorkerExit::Superseded) => summary.superseded += 1,
                Ok(WorkerExit::ProbeFailed) => summary.probe_failed += 1,
                Err(e) => {
                    warn!("Worker on {} panicked: {}", self.target, e);
                    summary.panicked += 1;
                }
            }
        }
        Ok(summary)
    }
}
