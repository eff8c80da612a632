use std::sync::Arc;
use tracing::{debug, warn};

use crate::probe::ProbeFactory;
use crate::store::WorkerGuard;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop was raised for its phase
    Stopped,
    /// A newer phase began before the stop reached this worker
    Superseded,
    /// Could not build its probe
    ProbeFailed,
}

/// Load `target` until the phase held by `guard` stops or is superseded.
///
/// The guard is dropped on return (or unwind), releasing this worker's
/// place in the active count exactly once.
pub async fn run_worker(
    id: usize,
    target: Arc<str>,
    guard: WorkerGuard,
    probes: Arc<dyn ProbeFactory>,
) -> WorkerExit {
    let store = Arc::clone(guard.store());
    let epoch = guard.epoch();

    let probe = match probes.build() {
        Ok(probe) => probe,
        Err(e) => {
            warn!("Worker {} could not build its probe: {:#}", id, e);
            return WorkerExit::ProbeFailed;
        }
    };

    debug!("Worker {} loading {} with the {} probe", id, target, probe.name());

    let mut sent = 0u64;
    let exit = loop {
        if !store.is_active(epoch) {
            break exit_reason(store.epoch(), epoch);
        }

        let outcome = probe.fetch(&target).await;
        let category = store.categorizer().categorize(outcome);
        sent += 1;

        if !store.increment(epoch, category) {
            break exit_reason(store.epoch(), epoch);
        }
    };

    debug!(
        "Worker {} on {} exiting after {} requests ({:?})",
        id, target, sent, exit
    );
    drop(guard);
    exit
}

fn exit_reason(current: u64, mine: u64) -> WorkerExit {
    if current == mine {
        WorkerExit::Stopped
    } else {
        WorkerExit::Superseded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Categorizer, Outcome};
    use crate::probe::{MockProbe, Probe};
    use crate::store::MetricsStore;
    use anyhow::Result;
    use std::time::Duration;

    fn store() -> Arc<MetricsStore> {
        Arc::new(MetricsStore::new(Categorizer::new(vec![200, 404])))
    }

    struct BrokenFactory;

    impl ProbeFactory for BrokenFactory {
        fn build(&self) -> Result<Box<dyn Probe>> {
            anyhow::bail!("no client for you")
        }
    }

    #[tokio::test]
    async fn test_worker_counts_until_stopped() {
        let store = store();
        let epoch = store.begin_phase("http://a.test/").unwrap();
        let guard = store.register_worker(epoch);
        let probes: Arc<dyn ProbeFactory> =
            Arc::new(MockProbe::new(2).otherwise(Outcome::Status(418)));

        let handle = tokio::spawn(run_worker(0, Arc::from("http://a.test/"), guard, probes));
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.raise_stop(epoch);

        assert_eq!(handle.await.unwrap(), WorkerExit::Stopped);
        assert_eq!(store.active_workers(), 0);

        let report = store.snapshot();
        let site = report.site("http://a.test/").unwrap();
        assert!(site.metrics.get("other") > 0);
        assert_eq!(site.metrics.get("other"), site.metrics.total());
    }

    #[tokio::test]
    async fn test_worker_exits_when_superseded() {
        let store = store();
        let epoch = store.begin_phase("http://a.test/").unwrap();
        let guard = store.register_worker(epoch);
        let probes: Arc<dyn ProbeFactory> = Arc::new(MockProbe::new(20));

        let handle = tokio::spawn(run_worker(0, Arc::from("http://a.test/"), guard, probes));
        tokio::time::sleep(Duration::from_millis(5)).await;
        // No stop raised for the first phase
        store.begin_phase("http://b.test/").unwrap();

        assert_eq!(handle.await.unwrap(), WorkerExit::Superseded);
        assert_eq!(store.active_workers(), 0);
        let report = store.snapshot();
        assert_eq!(report.site("http://b.test/").unwrap().metrics.total(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_releases_guard() {
        let store = store();
        let epoch = store.begin_phase("http://a.test/").unwrap();
        let guard = store.register_worker(epoch);
        assert_eq!(store.active_workers(), 1);

        let probes = Arc::new(BrokenFactory);
        let exit = run_worker(0, Arc::from("http://a.test/"), guard, probes).await;
        assert_eq!(exit, WorkerExit::ProbeFailed);
        assert_eq!(store.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_stopped_before_start_sends_nothing() {
        let store = store();
        let epoch = store.begin_phase("http://a.test/").unwrap();
        let guard = store.register_worker(epoch);
        store.raise_stop(epoch);

        let probes = Arc::new(MockProbe::new(1));
        let exit = run_worker(0, Arc::from("http://a.test/"), guard, probes).await;
        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(store.snapshot().aggregated.total(), 0);
    }
}
