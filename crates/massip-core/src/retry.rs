//! Retry with exponential backoff and rotation across interchangeable
//! endpoints.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigResult};
use crate::plugin::PluginResult;

pub const RETRY_EXHAUSTED: &str = "operation failed after retries or rate-limited on all attempts";

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            backoff_factor: 1.1,
        }
    }
}

impl RetrySettings {
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(ConfigError::Settings(
                "retry.backoff_factor must be a finite number greater than 1".into(),
            ));
        }
        Ok(())
    }
}

/// Picks the next endpoint. Returns an index into `endpoints` (never empty);
/// `previous` is the endpoint used by the attempt before, if any.
pub trait EndpointSelector: Send + Sync {
    fn select(&self, endpoints: &[&str], previous: Option<usize>) -> usize;
}

/// Uniform choice among every endpoint except the previous one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl EndpointSelector for RandomSelector {
    fn select(&self, endpoints: &[&str], previous: Option<usize>) -> usize {
        let previous = previous.filter(|&p| p < endpoints.len() && endpoints.len() > 1);
        let choices = endpoints.len() - usize::from(previous.is_some());
        let index = rand::rng().random_range(0..choices);
        match previous {
            Some(p) if index >= p => index + 1,
            _ => index,
        }
    }
}

/// Deterministic rotation through the full list: first endpoint, then the one
/// after the previous, wrapping around.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinSelector;

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, endpoints: &[&str], previous: Option<usize>) -> usize {
        previous.map_or(0, |p| (p + 1) % endpoints.len())
    }
}

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// A usable answer; stop.
    Completed(PluginResult),
    /// A failure that retrying will not fix; stop.
    Failed(PluginResult),
    /// Transport/process error or rate limiting; back off and try again.
    Retryable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Completed { result: PluginResult, attempts: u32 },
    Failed { result: PluginResult, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

impl RetryOutcome {
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Completed { .. })
    }

    pub fn into_result(self) -> PluginResult {
        match self {
            Self::Completed { result, .. } | Self::Failed { result, .. } => result,
            Self::Exhausted { .. } => PluginResult::failure(RETRY_EXHAUSTED),
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    selector: Arc<dyn EndpointSelector>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            selector: Arc::new(RandomSelector),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn EndpointSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Next endpoint index, never repeating `previous` when there is a choice.
    fn pick(&self, endpoints: &[String], previous: Option<usize>) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        let names: Vec<&str> = endpoints.iter().map(String::as_str).collect();
        let len = endpoints.len();
        let choice = self.selector.select(&names, previous);

        if choice >= len || (len > 1 && Some(choice) == previous) {
            return Some(previous.map_or(0, |p| (p + 1) % len));
        }
        Some(choice)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.settings.backoff_factor)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    /// Run `attempt` until it completes, fails for good, or the attempt budget
    /// runs out. `attempt` receives the chosen endpoint, or `None` when no
    /// endpoints are declared.
    pub async fn run<F, Fut>(&self, endpoints: &[String], mut attempt: F) -> RetryOutcome
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = self.settings.initial_delay();
        let mut previous = None;
        let mut last_error = String::new();

        for number in 1..=max_attempts {
            let index = self.pick(endpoints, previous);
            previous = index;
            let endpoint = index.map(|i| endpoints[i].clone());

            tracing::debug!(attempt = number, endpoint = ?endpoint, "starting attempt");

            match attempt(endpoint.clone()).await {
                Attempt::Completed(result) => {
                    return RetryOutcome::Completed {
                        result,
                        attempts: number,
                    }
                }
                Attempt::Failed(result) => {
                    return RetryOutcome::Failed {
                        result,
                        attempts: number,
                    }
                }
                Attempt::Retryable(reason) => {
                    tracing::debug!(
                        attempt = number,
                        endpoint = ?endpoint,
                        %reason,
                        delay_ms = delay.as_millis(),
                        "retryable failure"
                    );
                    last_error = reason;
                    if number < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = self.next_delay(delay);
                    }
                }
            }
        }

        tracing::warn!(attempts = max_attempts, %last_error, "retries exhausted");
        RetryOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }
}
