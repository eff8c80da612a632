use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Status codes that get their own bucket unless the run overrides them.
pub const DEFAULT_TRACK_CODES: &[u16] = &[
    100, 101, // informational
    200, 201, 202, 204, // success
    301, 302, 304, // redirects
    400, 401, 403, 404, 408, 429, // client errors
    500, 502, 503, 504, // server errors
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject anything the engine cannot run with. Called once at startup,
    /// before the first phase begins.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.load.validate()?;
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_addr))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Endpoints to load, one phase each, in this order
    pub targets: Vec<String>,
    /// Concurrent workers per phase
    pub workers: u32,
    /// Length of each phase in seconds
    pub duration_secs: u64,
    /// Status codes counted individually; everything else lands in `other`
    pub track_codes: Vec<u16>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Upper bound on waiting for a stopped pool to exit, in milliseconds
    pub drain_timeout_ms: u64,
}

impl LoadConfig {
    pub fn phase_duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("At least one target URL is required");
        }

        let mut seen = BTreeSet::new();
        for raw in &self.targets {
            validate_target(raw).with_context(|| format!("Invalid target entry: {raw}"))?;
            if !seen.insert(raw.as_str()) {
                anyhow::bail!("Target listed more than once: {raw}");
            }
        }

        if self.workers == 0 {
            anyhow::bail!("Worker count must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("Request timeout must be non-zero");
        }

        let mut codes = BTreeSet::new();
        for &code in &self.track_codes {
            if !(100..=999).contains(&code) {
                anyhow::bail!("Tracked status code out of range: {code}");
            }
            if !codes.insert(code) {
                anyhow::bail!("Tracked status code listed more than once: {code}");
            }
        }

        Ok(())
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            targets: vec!["https://example.com".to_string()],
            workers: 10,
            duration_secs: 60,
            track_codes: DEFAULT_TRACK_CODES.to_vec(),
            request_timeout_ms: 5_000,
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the report endpoint listens on (e.g., "0.0.0.0:8080")
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

fn validate_target(raw: &str) -> anyhow::Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    match url.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("Target must be http:// or https:// (got scheme={other})"),
    }
    if url.host_str().is_none() {
        anyhow::bail!("Target must include a hostname (got {raw})");
    }

    Ok(url)
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_codes(raw: &str) -> anyhow::Result<Vec<u16>> {
    split_list(raw)
        .iter()
        .map(|s| {
            s.parse::<u16>()
                .with_context(|| format!("Invalid status code: {s}"))
        })
        .collect()
}
