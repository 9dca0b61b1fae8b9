//! Composable readiness checks for devnet clients.
//!
//! A [`WaitStrategy`] polls a [`WaitTarget`] on a fixed interval until it is ready,
//! the strategy's timeout elapses, or the caller's [`CancellationToken`] fires.
//! Cancellation always wins over the strategy's own timeout.

use crate::{rpc, Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Method;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Sub-timeout given to each sync check; running out of it means "still syncing".
pub const SYNC_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Path probed on consensus clients by the default bundle
pub const BEACON_HEALTH_PATH: &str = "/eth/v1/node/health";

/// A target that can block until it reports being in sync
#[async_trait]
pub trait SyncCheck: Send + Sync {
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<()>;
}

/// A target that can report whether it is healthy
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self, cancel: &CancellationToken) -> bool;
}

/// Something a wait strategy can be pointed at
///
/// Each capability is optional; strategies that need a capability the target
/// lacks fail immediately with [`Error::UnsupportedTarget`].
pub trait WaitTarget: Send + Sync {
    /// Human-readable name used in errors and logs
    fn describe(&self) -> String;

    /// Base URL probed by [`HttpProbe`]
    fn probe_url(&self) -> Option<String> {
        None
    }

    fn sync_check(&self) -> Option<&dyn SyncCheck> {
        None
    }

    fn health_check(&self) -> Option<&dyn HealthCheck> {
        None
    }
}

/// A raw URL is probed as-is
impl WaitTarget for String {
    fn describe(&self) -> String {
        self.clone()
    }

    fn probe_url(&self) -> Option<String> {
        Some(self.clone())
    }
}

/// Readiness check run against a target
#[async_trait]
pub trait WaitStrategy: Send + Sync {
    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> Result<()>;
}

/// Poll `condition` every `interval` until it yields a value.
///
/// `Ok(None)` keeps polling, `Err` aborts immediately. Each iteration races the
/// tick and the check itself against the deadline and the cancellation token.
pub(crate) async fn poll_until<T, F, Fut>(
    resource: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let timed_out = || Error::WaitTimeout {
        resource: resource.to_string(),
        timeout,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = &mut deadline => return Err(timed_out()),
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = &mut deadline => return Err(timed_out()),
            outcome = condition() => match outcome {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => tracing::trace!("{} not ready yet", resource),
                Err(e) => return Err(e),
            },
        }
    }
}

/// Polls an HTTP endpoint until it answers with an expected status
#[derive(Debug, Clone)]
pub struct HttpProbe {
    method: Method,
    path: String,
    expected_statuses: Vec<u16>,
    interval: Duration,
    timeout: Duration,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            expected_statuses: vec![200],
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Path appended to the target's base URL
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_statuses = vec![status];
        self
    }

    /// Accept any of `statuses` as ready
    pub fn expect_statuses(mut self, statuses: &[u16]) -> Self {
        self.expected_statuses = statuses.to_vec();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WaitStrategy for HttpProbe {
    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> Result<()> {
        let base = target.probe_url().ok_or_else(|| {
            Error::UnsupportedTarget(format!(
                "{} does not expose an HTTP endpoint",
                target.describe()
            ))
        })?;
        if base.trim().is_empty() {
            return Err(Error::UnsupportedTarget(format!(
                "{} has no HTTP endpoint URL",
                target.describe()
            )));
        }

        let url = join_url(&base, &self.path);
        tracing::debug!("Waiting for {} {} to return {:?}", self.method, url, self.expected_statuses);

        let client = rpc::http_client();
        let method = &self.method;
        let expected = self.expected_statuses.as_slice();
        let request_url = url.as_str();

        poll_until(&url, self.interval, self.timeout, cancel, || async move {
            match client.request(method.clone(), request_url).send().await {
                Ok(response) if expected.contains(&response.status().as_u16()) => Ok(Some(())),
                Ok(response) => {
                    tracing::trace!("{} returned {}", request_url, response.status());
                    Ok(None)
                }
                Err(e) => {
                    tracing::trace!("{} unreachable: {}", request_url, e);
                    Ok(None)
                }
            }
        })
        .await
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Polls the target's sync capability until it reports being synced
#[derive(Debug, Clone)]
pub struct SyncProbe {
    interval: Duration,
    timeout: Duration,
}

impl Default for SyncProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProbe {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WaitStrategy for SyncProbe {
    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> Result<()> {
        let checker = target.sync_check().ok_or_else(|| {
            Error::UnsupportedTarget(format!("{} cannot report sync status", target.describe()))
        })?;

        let resource = format!("{} to sync", target.describe());
        poll_until(&resource, self.interval, self.timeout, cancel, || async move {
            match tokio::time::timeout(SYNC_CHECK_TIMEOUT, checker.wait_for_sync(cancel)).await {
                Ok(Ok(())) => Ok(Some(())),
                Ok(Err(e)) => Err(e),
                // Still syncing
                Err(_) => Ok(None),
            }
        })
        .await
    }
}

/// Polls the target's health capability until it reports healthy
#[derive(Debug, Clone)]
pub struct HealthProbe {
    interval: Duration,
    timeout: Duration,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WaitStrategy for HealthProbe {
    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> Result<()> {
        let checker = target.health_check().ok_or_else(|| {
            Error::UnsupportedTarget(format!("{} cannot report health", target.describe()))
        })?;

        let resource = format!("{} to become healthy", target.describe());
        poll_until(&resource, self.interval, self.timeout, cancel, || async move {
            Ok(checker.is_healthy(cancel).await.then_some(()))
        })
        .await
    }
}

/// Runs child strategies one after another or all at once
#[derive(Clone)]
pub struct Combined {
    strategies: Vec<Arc<dyn WaitStrategy>>,
    parallel: bool,
}

impl Combined {
    /// Children run in order; the first failure stops the chain.
    pub fn sequential(strategies: Vec<Arc<dyn WaitStrategy>>) -> Self {
        Self {
            strategies,
            parallel: false,
        }
    }

    /// Children run concurrently; all of them are awaited before returning.
    pub fn parallel(strategies: Vec<Arc<dyn WaitStrategy>>) -> Self {
        Self {
            strategies,
            parallel: true,
        }
    }

    pub fn with(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[async_trait]
impl WaitStrategy for Combined {
    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> Result<()> {
        if !self.parallel {
            for (index, strategy) in self.strategies.iter().enumerate() {
                strategy
                    .wait_until_ready(cancel, target)
                    .await
                    .map_err(|e| Error::WaitStep {
                        index,
                        source: Box::new(e),
                    })?;
            }
            return Ok(());
        }

        let mut pending: FuturesUnordered<_> = self
            .strategies
            .iter()
            .enumerate()
            .map(|(index, strategy)| async move {
                (index, strategy.wait_until_ready(cancel, target).await)
            })
            .collect();

        let mut first_error = None;
        while let Some((index, outcome)) = pending.next().await {
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(Error::WaitStep {
                        index,
                        source: Box::new(e),
                    });
                } else {
                    tracing::debug!("Wait strategy {} also failed: {}", index, e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// HTTP probe of the RPC port followed by a health check.
///
/// Geth answers bare GETs with 200; most other execution clients reject them
/// with 405. Either proves the RPC server is listening.
pub fn default_execution_wait() -> Combined {
    Combined::sequential(vec![
        Arc::new(HttpProbe::new().expect_statuses(&[405, 200])),
        Arc::new(HealthProbe::new()),
    ])
}

/// HTTP probe of the beacon health endpoint followed by a health check.
pub fn default_consensus_wait() -> Combined {
    Combined::sequential(vec![
        Arc::new(HttpProbe::new().path(BEACON_HEALTH_PATH).expect_status(200)),
        Arc::new(HealthProbe::new()),
    ])
}
