use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::category::{Categorizer, Category, CategoryCounts};
use crate::report::{Report, SiteReport};

/// Where the scheduler is in its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Running(String),
    Draining(String),
    Done,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Idle => f.write_str("idle"),
            PhaseState::Running(target) => write!(f, "running {target}"),
            PhaseState::Draining(target) => write!(f, "draining {target}"),
            PhaseState::Done => f.write_str("done"),
        }
    }
}

struct SiteMetrics {
    target: String,
    counts: CategoryCounts,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

struct EngineState {
    current_target: Option<String>,
    /// Generation of the current phase; 0 before the first phase
    epoch: u64,
    stopping: bool,
    active_workers: usize,
    phase: PhaseState,
    /// One entry per started phase, in phase order
    sites: Vec<SiteMetrics>,
    aggregated: CategoryCounts,
}

/// Shared counters and phase bookkeeping for the whole run.
///
/// Everything lives behind one lock. Workers, the scheduler and report
/// readers all go through it, and it is never held across an `.await`.
/// Writes are fenced by epoch: only workers of the current phase can
/// touch the counters, so stragglers from a stopped phase never land in
/// the next target's bucket.
pub struct MetricsStore {
    categorizer: Categorizer,
    state: Mutex<EngineState>,
    drained: Notify,
}

impl MetricsStore {
    pub fn new(categorizer: Categorizer) -> Self {
        let aggregated = categorizer.zeroed();
        Self {
            categorizer,
            state: Mutex::new(EngineState {
                current_target: None,
                epoch: 0,
                stopping: false,
                active_workers: 0,
                phase: PhaseState::Idle,
                sites: Vec::new(),
                aggregated,
            }),
            drained: Notify::new(),
        }
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    /// Make `target` current, open its metrics and return the new epoch.
    ///
    /// Fails if `target` already had a phase in this run.
    pub fn begin_phase(&self, target: &str) -> Result<u64> {
        let mut state = self.state.lock();
        if state.sites.iter().any(|s| s.target == target) {
            anyhow::bail!("Target already had a phase in this run: {target}");
        }

        state.epoch += 1;
        state.stopping = false;
        state.current_target = Some(target.to_string());
        state.sites.push(SiteMetrics {
            target: target.to_string(),
            counts: self.categorizer.zeroed(),
            start_time: Utc::now(),
            end_time: None,
        });
        Ok(state.epoch)
    }

    /// Record one completed request for the phase identified by `epoch`.
    ///
    /// The write is dropped if `epoch` is no longer current. Returns whether
    /// the caller should keep issuing requests.
    pub fn increment(&self, epoch: u64, category: Category) -> bool {
        let slot = self.categorizer.slot(category);
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }

        let state = &mut *state;
        if let Some(site) = state.sites.last_mut() {
            site.counts.bump(slot);
            state.aggregated.bump(slot);
        }
        !state.stopping
    }

    /// Whether workers of `epoch` may issue another request.
    pub fn is_active(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.epoch == epoch && !state.stopping
    }

    pub fn raise_stop(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.stopping = true;
        }
    }

    /// Stamp the end time of `target`'s phase. Later calls keep the first stamp.
    pub fn record_end(&self, target: &str) {
        let mut state = self.state.lock();
        if let Some(site) = state.sites.iter_mut().find(|s| s.target == target) {
            site.end_time.get_or_insert_with(Utc::now);
        }
    }

    /// Count one more live worker for `epoch`. The count drops again when the
    /// returned guard is dropped, whichever way the worker exits.
    pub fn register_worker(self: &Arc<Self>, epoch: u64) -> WorkerGuard {
        self.state.lock().active_workers += 1;
        WorkerGuard {
            store: Arc::clone(self),
            epoch,
        }
    }

    pub fn active_workers(&self) -> usize {
        self.state.lock().active_workers
    }

    /// Wait until no worker is alive, or fail after `timeout`.
    pub async fn drain_wait(&self, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                // Register before checking so a wakeup between the check and the
                // await is not lost.
                notified.as_mut().enable();
                if self.active_workers() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => Ok(()),
            Err(_) => anyhow::bail!(
                "Drain did not complete within {}ms ({} workers still active)",
                timeout.as_millis(),
                self.active_workers()
            ),
        }
    }

    pub fn set_phase(&self, phase: PhaseState) {
        self.state.lock().phase = phase;
    }

    pub fn phase(&self) -> PhaseState {
        self.state.lock().phase.clone()
    }

    pub fn current_target(&self) -> Option<String> {
        self.state.lock().current_target.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Copy the whole state under a single lock hold.
    pub fn snapshot(&self) -> Report {
        let state = self.state.lock();
        let sites = state
            .sites
            .iter()
            .map(|s| SiteReport::new(s.target.clone(), s.counts.clone(), s.start_time, s.end_time))
            .collect();

        Report {
            current_site: state.current_target.clone(),
            sites,
            aggregated: state.aggregated.clone(),
            timestamp: Utc::now(),
        }
    }

    fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.active_workers = state.active_workers.saturating_sub(1);
        if state.active_workers == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Live-worker registration; see [`MetricsStore::register_worker`].
pub struct WorkerGuard {
    store: Arc<MetricsStore>,
    epoch: u64,
}

impl WorkerGuard {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.store.worker_exited();
    }
}
