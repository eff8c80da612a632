use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::category::CategoryCounts;

/// Point-in-time copy of everything the store knows, as served to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Target under load, or the last one once the run is over
    pub current_site: Option<String>,
    /// Per-target results in phase order
    #[serde(serialize_with = "serialize_sites")]
    pub sites: Vec<SiteReport>,
    pub aggregated: CategoryCounts,
    /// When this report was generated
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    #[serde(skip)]
    pub target: String,
    pub metrics: CategoryCounts,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end, once the phase has ended
    pub duration: Option<f64>,
}

impl SiteReport {
    pub fn new(
        target: String,
        metrics: CategoryCounts,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        let duration = end_time.map(|end| {
            let elapsed = end.signed_duration_since(start_time);
            elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
        });
        Self {
            target,
            metrics,
            start_time,
            end_time,
            duration,
        }
    }
}

impl Report {
    pub fn site(&self, target: &str) -> Option<&SiteReport> {
        self.sites.iter().find(|s| s.target == target)
    }

    pub fn total_requests(&self) -> u64 {
        self.aggregated.total()
    }
}

fn serialize_sites<S: Serializer>(sites: &[SiteReport], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(sites.len()))?;
    for site in sites {
        map.serialize_entry(&site.target, site)?;
    }
    map.end()
}

pub fn print_summary(report: &Report) {
    println!("\n=== Run Summary ===");
    match &report.current_site {
        Some(site) => println!("Last target: {site}"),
        None => println!("Last target: none"),
    }
    for site in &report.sites {
        println!();
        println!("Target: {}", site.target);
        println!("Started: {}", site.start_time.to_rfc3339());
        match (site.end_time, site.duration) {
            (Some(end), Some(duration)) => {
                println!("Ended: {} ({:.2}s)", end.to_rfc3339(), duration)
            }
            _ => println!("Ended: still running"),
        }
        for (label, count) in site.metrics.iter().filter(|(_, c)| *c > 0) {
            println!("  {label}: {count}");
        }
    }
    println!();
    println!("Total requests: {}", report.total_requests());
    for (label, count) in report.aggregated.iter().filter(|(_, c)| *c > 0) {
        println!("  {label}: {count}");
    }
    println!();
}
