use anyhow::Result;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

use crate::category::Outcome;

/// Issues a single request against a target.
///
/// Implementations never return an error: every failure, timeout included,
/// comes back as [`Outcome::Failed`].
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>>;
}

/// Builds the private probe each worker owns.
pub trait ProbeFactory: Send + Sync {
    fn build(&self) -> Result<Box<dyn Probe>>;
}

/// Scripted probe for tests and dry runs: answers per target after a fixed delay.
#[derive(Debug, Clone)]
pub struct MockProbe {
    delay: Duration,
    default: Outcome,
    per_target: HashMap<String, Outcome>,
}

impl MockProbe {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            default: Outcome::Status(200),
            per_target: HashMap::new(),
        }
    }

    pub fn answer(mut self, target: impl Into<String>, outcome: Outcome) -> Self {
        self.per_target.insert(target.into(), outcome);
        self
    }

    pub fn otherwise(mut self, outcome: Outcome) -> Self {
        self.default = outcome;
        self
    }
}

impl Probe for MockProbe {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn fetch<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            sleep(self.delay).await;
            self.per_target
                .get(target)
                .copied()
                .unwrap_or(self.default)
        })
    }
}

impl ProbeFactory for MockProbe {
    fn build(&self) -> Result<Box<dyn Probe>> {
        Ok(Box::new(self.clone()))
    }
}

/// Plain GET against the target with a bounded timeout.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, timeout })
    }
}

impl Probe for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            // The client timeout covers the body too; this one also bounds
            // anything the client does before its own timer starts.
            let request = self.client.get(target).send();
            match tokio::time::timeout(self.timeout, request).await {
                Ok(Ok(response)) => Outcome::Status(response.status().as_u16()),
                Ok(Err(e)) => {
                    tracing::debug!("Request to {} failed: {}", target, e);
                    Outcome::Failed
                }
                Err(_) => {
                    tracing::debug!("Request to {} timed out", target);
                    Outcome::Failed
                }
            }
        })
    }
}

/// Hands every worker its own [`HttpProbe`], so connection pools are never shared.
#[derive(Debug, Clone)]
pub struct HttpProbeFactory {
    timeout: Duration,
}

impl HttpProbeFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProbeFactory for HttpProbeFactory {
    fn build(&self) -> Result<Box<dyn Probe>> {
        Ok(Box::new(HttpProbe::new(self.timeout)?))
    }
}
