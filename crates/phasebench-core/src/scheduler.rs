use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::LoadConfig;
use crate::pool::WorkerPool;
use crate::probe::ProbeFactory;
use crate::store::{MetricsStore, PhaseState};

/// What the scheduler will run: targets in order, and how hard and how long
/// to hit each one.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub targets: Vec<String>,
    pub workers: usize,
    pub phase_duration: Duration,
    pub drain_timeout: Duration,
}

impl PhasePlan {
    /// Sum of all phase durations, saturating at [`Duration::MAX`].
    pub fn total_duration(&self) -> Duration {
        u32::try_from(self.targets.len())
            .ok()
            .and_then(|phases| self.phase_duration.checked_mul(phases))
            .unwrap_or(Duration::MAX)
    }
}

impl From<&LoadConfig> for PhasePlan {
    fn from(config: &LoadConfig) -> Self {
        Self {
            targets: config.targets.clone(),
            workers: config.workers as usize,
            phase_duration: config.phase_duration(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// Drives one phase per target, strictly one after another.
///
/// Idle -> Running(t) -> Draining(t) -> Running(next) ... -> Done. After the
/// last phase the store keeps pointing at the last target.
pub struct Scheduler {
    store: Arc<MetricsStore>,
    plan: PhasePlan,
    probes: Arc<dyn ProbeFactory>,
}

impl Scheduler {
    pub fn new(store: Arc<MetricsStore>, plan: PhasePlan, probes: Arc<dyn ProbeFactory>) -> Self {
        Self {
            store,
            plan,
            probes,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Planned {} phases of {}ms with {} workers each",
            self.plan.targets.len(),
            self.plan.phase_duration.as_millis(),
            self.plan.workers
        );

        for (idx, target) in self.plan.targets.iter().enumerate() {
            self.run_phase(idx, target).await?;
        }

        self.store.set_phase(PhaseState::Done);
        match self.store.current_target() {
            Some(last) => info!("All phases complete, last target {}", last),
            None => info!("No targets to run"),
        }
        Ok(())
    }

    async fn run_phase(&self, idx: usize, target: &str) -> Result<()> {
        let epoch = self.store.begin_phase(target)?;
        self.store.set_phase(PhaseState::Running(target.to_string()));
        info!("Starting phase {}: {} for {}ms", idx, target, self.plan.phase_duration.as_millis());

        let pool = WorkerPool::spawn(
            &self.store,
            target,
            epoch,
            self.plan.workers,
            Arc::clone(&self.probes),
        );

        sleep(self.plan.phase_duration).await;

        self.store.set_phase(PhaseState::Draining(target.to_string()));
        pool.stop();
        info!("Draining {} workers on {}", pool.len(), target);

        let summary = pool
            .drain(self.plan.drain_timeout)
            .await
            .with_context(|| format!("Phase {idx} ({target}) failed to drain"))?;
        if summary.probe_failed > 0 || summary.panicked > 0 {
            warn!(
                "Phase {}: {} workers failed to start, {} panicked",
                idx, summary.probe_failed, summary.panicked
            );
        }

        self.store.record_end(target);
        info!(
            "Finished phase {}: {} ({} workers stopped, {} superseded)",
            idx, target, summary.stopped, summary.superseded
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Categorizer, Outcome};
    use crate::probe::MockProbe;

    fn store() -> Arc<MetricsStore> {
        Arc::new(MetricsStore::new(Categorizer::new(vec![200, 404])))
    }

    fn plan(targets: &[&str], workers: usize, phase_ms: u64) -> PhasePlan {
        PhasePlan {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            workers,
            phase_duration: Duration::from_millis(phase_ms),
            drain_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_plan_from_config() {
        let config = LoadConfig {
            targets: vec!["http://a.test/".to_string(), "http://b.test/".to_string()],
            workers: 3,
            duration_secs: 2,
            ..LoadConfig::default()
        };
        let plan = PhasePlan::from(&config);
        assert_eq!(plan.workers, 3);
        assert_eq!(plan.phase_duration, Duration::from_secs(2));
        assert_eq!(plan.total_duration(), Duration::from_secs(4));
        assert_eq!(plan.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_total_duration_saturates() {
        let config = LoadConfig {
            targets: vec!["http://a.test/".to_string(), "http://b.test/".to_string()],
            duration_secs: u64::MAX,
            ..LoadConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(PhasePlan::from(&config).total_duration(), Duration::MAX);

        assert_eq!(plan(&[], 1, 100).total_duration(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_two_phase_scenario() {
        let store = store();
        let probes = MockProbe::new(2)
            .answer("http://a.test/", Outcome::Status(200))
            .answer("http://b.test/", Outcome::Failed);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            plan(&["http://a.test/", "http://b.test/"], 2, 100),
            Arc::new(probes),
        );

        scheduler.run().await.unwrap();

        let report = store.snapshot();
        assert_eq!(report.current_site.as_deref(), Some("http://b.test/"));
        assert_eq!(store.phase(), PhaseState::Done);
        assert_eq!(store.active_workers(), 0);

        let a = report.site("http://a.test/").unwrap();
        let b = report.site("http://b.test/").unwrap();
        assert!(a.metrics.get("200") > 0);
        assert_eq!(a.metrics.total(), a.metrics.get("200"));
        assert!(b.metrics.get("error") > 0);
        assert_eq!(b.metrics.total(), b.metrics.get("error"));

        assert_eq!(report.aggregated.get("200"), a.metrics.get("200"));
        assert_eq!(report.aggregated.get("error"), b.metrics.get("error"));
        assert_eq!(report.aggregated.get("other"), 0);

        // Phases ran in order and never overlapped
        let a_end = a.end_time.unwrap();
        let b_end = b.end_time.unwrap();
        assert!(a.start_time <= a_end);
        assert!(a_end <= b.start_time);
        assert!(b.start_time <= b_end);
        assert_eq!(report.sites[0].target, "http://a.test/");
        assert_eq!(report.sites[1].target, "http://b.test/");
    }

    #[tokio::test]
    async fn test_untracked_code_counts_as_other() {
        let store = store();
        let probes = MockProbe::new(2).otherwise(Outcome::Status(418));
        Scheduler::new(Arc::clone(&store), plan(&["http://teapot.test/"], 1, 50), Arc::new(probes))
            .run()
            .await
            .unwrap();

        let report = store.snapshot();
        let site = report.site("http://teapot.test/").unwrap();
        assert!(site.metrics.get("other") > 0);
        assert_eq!(site.metrics.total(), site.metrics.get("other"));
        assert_eq!(site.metrics.iter().count(), 4);
    }

    #[tokio::test]
    async fn test_zero_duration_starts_and_drains() {
        let store = store();
        Scheduler::new(
            Arc::clone(&store),
            plan(&["http://a.test/", "http://b.test/"], 4, 0),
            Arc::new(MockProbe::new(1)),
        )
        .run()
        .await
        .unwrap();

        let report = store.snapshot();
        assert_eq!(report.sites.len(), 2);
        assert!(report.sites.iter().all(|s| s.end_time.is_some()));
        assert_eq!(store.active_workers(), 0);
        assert_eq!(store.phase(), PhaseState::Done);
    }

    #[tokio::test]
    async fn test_empty_plan_is_done_immediately() {
        let store = store();
        Scheduler::new(Arc::clone(&store), plan(&[], 2, 100), Arc::new(MockProbe::new(1)))
            .run()
            .await
            .unwrap();

        assert_eq!(store.phase(), PhaseState::Done);
        assert_eq!(store.snapshot().current_site, None);
    }

    #[tokio::test]
    async fn test_stuck_drain_fails_the_run() {
        let store = store();
        let mut plan = plan(&["http://slow.test/"], 1, 0);
        plan.drain_timeout = Duration::from_millis(50);
        let err = Scheduler::new(Arc::clone(&store), plan, Arc::new(MockProbe::new(10_000)))
            .run()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("failed to drain"), "{err:#}");
        assert_eq!(
            store.phase(),
            PhaseState::Draining("http://slow.test/".to_string())
        );
    }

    #[tokio::test]
    async fn test_snapshots_never_decrease() {
        let store = store();
        let probes = MockProbe::new(1)
            .answer("http://a.test/", Outcome::Status(200))
            .answer("http://b.test/", Outcome::Failed)
            .answer("http://c.test/", Outcome::Status(404))
            .otherwise(Outcome::Status(418));
        let targets = ["http://a.test/", "http://b.test/", "http://c.test/", "http://d.test/"];
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            plan(&targets, 3, 100),
            Arc::new(probes),
        );
        let run = tokio::spawn(scheduler.run());

        let mut previous = store.snapshot();
        while store.phase() != PhaseState::Done {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let next = store.snapshot();
            for site in &previous.sites {
                let now = next.site(&site.target).unwrap();
                for (label, count) in site.metrics.iter() {
                    assert!(now.metrics.get(label) >= count, "{label} went down");
                }
            }
            for (label, aggregated) in next.aggregated.iter() {
                let per_site: u64 = next.sites.iter().map(|s| s.metrics.get(label)).sum();
                assert_eq!(per_site, aggregated, "aggregated {label} drifted");
            }
            previous = next;
        }

        run.await.unwrap().unwrap();
        let report = store.snapshot();
        for label in ["200", "404", "other", "error"] {
            assert!(report.aggregated.get(label) > 0, "no {label} recorded");
        }
    }
}
