use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;

use crate::address;
use crate::plugin::{Plugin, PluginCall, PluginError, PluginResult};
use crate::retry::{Attempt, RetryPolicy};
use crate::settings::Settings;

pub const NON_CONFORMING_RESULT: &str = "plugin returned a non-conforming result";

pub fn private_skip_message(entity: &str) -> String {
    format!("{entity} is in a private address range, skipped")
}

/// How one (entity, plugin) invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The plugin was not called.
    Skipped(PluginResult),
    /// The plugin answered; `success` may still be false.
    Completed(PluginResult),
    /// The plugin errored, panicked, timed out, answered with a malformed
    /// shape, or exhausted its retries.
    Failed(PluginResult),
}

impl Invocation {
    pub const fn result(&self) -> &PluginResult {
        match self {
            Self::Skipped(r) | Self::Completed(r) | Self::Failed(r) => r,
        }
    }

    pub fn into_result(self) -> PluginResult {
        match self {
            Self::Skipped(r) | Self::Completed(r) | Self::Failed(r) => r,
        }
    }

    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("plugin panicked: {0}")]
    Panicked(String),
    #[error("plugin did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("{}", NON_CONFORMING_RESULT)]
    Malformed,
}

impl AttemptError {
    const fn is_retryable(&self) -> bool {
        match self {
            Self::Plugin(e) => e.is_retryable(),
            Self::TimedOut(_) => true,
            Self::Panicked(_) | Self::Malformed => false,
        }
    }
}

/// Executes plugins with failure isolation: nothing a plugin does can escape
/// as anything other than a failed [`PluginResult`].
#[derive(Clone)]
pub struct PluginInvoker {
    attempt_timeout: Duration,
    retry: RetryPolicy,
}

impl PluginInvoker {
    #[must_use]
    pub const fn new(attempt_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            attempt_timeout,
            retry,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.attempt_timeout(),
            RetryPolicy::new(settings.retry.clone()),
        )
    }

    /// Whether `entity` must not be handed to `plugin`: network-facing plugins
    /// never see non-public addresses.
    pub fn screens(&self, plugin: &dyn Plugin, entity: &str) -> bool {
        plugin.metadata().network_facing && address::is_private_entity(entity)
    }

    pub async fn invoke(
        &self,
        plugin: &Arc<dyn Plugin>,
        entity: &str,
        parameter: &str,
    ) -> Invocation {
        if self.screens(plugin.as_ref(), entity) {
            tracing::debug!(plugin = plugin.name(), entity, "skipping non-public address");
            return Invocation::Skipped(PluginResult::success(private_skip_message(entity)));
        }

        let metadata = plugin.metadata();
        let parameter = if parameter.trim().is_empty() {
            metadata.default_parameter.clone()
        } else {
            parameter.to_string()
        };
        let limit = metadata.timeout.unwrap_or(self.attempt_timeout);

        let Some(declaration) = &metadata.retry else {
            let call = PluginCall::new(entity, parameter);
            return match attempt(Arc::clone(plugin), call, limit).await {
                Ok(result) => Invocation::Completed(result),
                Err(error) => {
                    tracing::debug!(plugin = plugin.name(), entity, %error, "invocation failed");
                    Invocation::Failed(PluginResult::failure(error.to_string()))
                }
            };
        };

        let marker = declaration.rate_limit_marker.as_deref();
        let outcome = self
            .retry
            .run(&declaration.endpoints, |endpoint| {
                let call = PluginCall::new(entity, parameter.clone()).with_endpoint(endpoint);
                let plugin = Arc::clone(plugin);
                async move { classify(attempt(plugin, call, limit).await, marker) }
            })
            .await;

        if outcome.is_failure() {
            Invocation::Failed(outcome.into_result())
        } else {
            Invocation::Completed(outcome.into_result())
        }
    }
}

fn classify(outcome: Result<PluginResult, AttemptError>, marker: Option<&str>) -> Attempt {
    match outcome {
        Ok(result) if marker.is_some_and(|m| result.output.contains(m)) => {
            Attempt::Retryable("rate-limit marker in response".to_string())
        }
        Ok(result) => Attempt::Completed(result),
        Err(error) if error.is_retryable() => Attempt::Retryable(error.to_string()),
        Err(error) => Attempt::Failed(PluginResult::failure(error.to_string())),
    }
}

/// One isolated attempt: its own task (so panics surface as join errors) under
/// a hard timeout.
async fn attempt(
    plugin: Arc<dyn Plugin>,
    call: PluginCall,
    limit: Duration,
) -> Result<PluginResult, AttemptError> {
    let handle = tokio::spawn(async move { plugin.invoke(&call).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(limit, handle).await {
        Err(_) => {
            abort.abort();
            Err(AttemptError::TimedOut(limit))
        }
        Ok(Err(join_error)) => Err(AttemptError::Panicked(panic_message(join_error))),
        Ok(Ok(Err(plugin_error))) => Err(plugin_error.into()),
        Ok(Ok(Ok(output))) => output.normalize().ok_or(AttemptError::Malformed),
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "plugin task was cancelled".to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        EchoPlugin, PluginMetadata, PluginOutcome, PluginOutput, RetryDeclaration,
    };
    use crate::retry::{RetrySettings, RETRY_EXHAUSTED};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Behavior {
        Echo,
        Error,
        Panic,
        Hang,
        Malformed,
        Rotating { good: &'static str, marker: &'static str },
    }

    struct Scripted {
        behavior: Behavior,
        metadata: PluginMetadata,
        calls: AtomicUsize,
        seen: Mutex<Vec<PluginCall>>,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Self {
            Self::with_metadata(behavior, PluginMetadata::new("scripted"))
        }

        fn with_metadata(behavior: Behavior, metadata: PluginMetadata) -> Self {
            Self {
                behavior,
                metadata,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Plugin for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn invoke(&self, call: &PluginCall) -> PluginOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(call.clone());
            match &self.behavior {
                Behavior::Echo => Ok(PluginOutput::Text(call.entity.clone())),
                Behavior::Error => Err(PluginError::Failed("exploded".into())),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(PluginOutput::Text("late".into()))
                }
                Behavior::Malformed => Ok(PluginOutput::Json(json!([1, 2, 3]))),
                Behavior::Rotating { good, marker } => {
                    if call.endpoint.as_deref() == Some(*good) {
                        Ok(PluginOutput::Text(format!("answer from {good}")))
                    } else {
                        Ok(PluginOutput::Text(format!("{marker}: slow down")))
                    }
                }
            }
        }
    }

    fn invoker() -> PluginInvoker {
        PluginInvoker::new(
            Duration::from_secs(5),
            RetryPolicy::new(RetrySettings {
                max_attempts: 20,
                initial_delay_ms: 0,
                backoff_factor: 2.0,
            }),
        )
    }

    fn as_plugin(plugin: &Arc<Scripted>) -> Arc<dyn Plugin> {
        Arc::clone(plugin) as Arc<dyn Plugin>
    }

    #[tokio::test]
    async fn test_private_addresses_never_reach_plugin() {
        let plugin = Arc::new(Scripted::new(Behavior::Echo));
        let dyn_plugin = as_plugin(&plugin);

        for entity in ["10.0.0.1", "192.168.1.1", "127.0.0.1"] {
            let invocation = invoker().invoke(&dyn_plugin, entity, "").await;
            assert_eq!(
                invocation,
                Invocation::Skipped(PluginResult::success(format!(
                    "{entity} is in a private address range, skipped"
                )))
            );
        }
        assert_eq!(plugin.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_plugins_see_private_addresses() {
        let plugin: Arc<dyn Plugin> = Arc::new(EchoPlugin::new());
        let invocation = invoker().invoke(&plugin, "10.0.0.1", "").await;
        assert_eq!(invocation, Invocation::Completed(PluginResult::success("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_same_input_same_success() {
        let plugin: Arc<dyn Plugin> = Arc::new(Scripted::new(Behavior::Echo));
        let first = invoker().invoke(&plugin, "1.2.3.4", "").await;
        let second = invoker().invoke(&plugin, "1.2.3.4", "").await;
        assert_eq!(first.result().success, second.result().success);
    }

    #[tokio::test]
    async fn test_default_parameter_applied() {
        let plugin = Arc::new(Scripted::with_metadata(
            Behavior::Echo,
            PluginMetadata::new("x").with_default_parameter("-c 1"),
        ));
        let dyn_plugin = as_plugin(&plugin);

        invoker().invoke(&dyn_plugin, "1.2.3.4", "").await;
        invoker().invoke(&dyn_plugin, "1.2.3.4", "-c 4").await;

        let seen = plugin.seen.lock().unwrap();
        assert_eq!(seen[0].parameter, "-c 1");
        assert_eq!(seen[1].parameter, "-c 4");
    }

    #[tokio::test]
    async fn test_plugin_error_becomes_failure() {
        let plugin: Arc<dyn Plugin> = Arc::new(Scripted::new(Behavior::Error));
        let invocation = invoker().invoke(&plugin, "1.2.3.4", "").await;
        assert_eq!(invocation, Invocation::Failed(PluginResult::failure("exploded")));
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let plugin: Arc<dyn Plugin> = Arc::new(Scripted::new(Behavior::Panic));
        let invocation = invoker().invoke(&plugin, "1.2.3.4", "").await;

        assert!(invocation.is_failure());
        assert_eq!(invocation.result().output, "plugin panicked: plugin bug");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced() {
        let plugin: Arc<dyn Plugin> = Arc::new(Scripted::new(Behavior::Hang));
        let invocation = PluginInvoker::new(
            Duration::from_secs(2),
            RetryPolicy::new(RetrySettings::default()),
        )
        .invoke(&plugin, "1.2.3.4", "")
        .await;

        assert!(invocation.is_failure());
        assert!(invocation.result().output.contains("did not finish"));
    }

    #[tokio::test]
    async fn test_malformed_shape_uses_fixed_message() {
        let plugin: Arc<dyn Plugin> = Arc::new(Scripted::new(Behavior::Malformed));
        let invocation = invoker().invoke(&plugin, "1.2.3.4", "").await;
        assert_eq!(
            invocation,
            Invocation::Failed(PluginResult::failure(NON_CONFORMING_RESULT))
        );
    }

    #[tokio::test]
    async fn test_rate_limited_endpoints_rotated_until_success() {
        let metadata = PluginMetadata::new("whois-like").with_retry(RetryDeclaration {
            endpoints: vec!["A".into(), "B".into(), "C".into()],
            rate_limit_marker: Some("BLOCK".into()),
        });
        let plugin = Arc::new(Scripted::with_metadata(
            Behavior::Rotating {
                good: "C",
                marker: "BLOCK",
            },
            metadata,
        ));
        let dyn_plugin = as_plugin(&plugin);

        let invocation = invoker().invoke(&dyn_plugin, "8.8.8.8", "").await;

        assert_eq!(
            invocation,
            Invocation::Completed(PluginResult::success("answer from C"))
        );
        let seen = plugin.seen.lock().unwrap();
        let endpoints: Vec<_> = seen.iter().map(|c| c.endpoint.clone().unwrap()).collect();
        assert!(endpoints.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let metadata = PluginMetadata::new("whois-like").with_retry(RetryDeclaration {
            endpoints: vec!["A".into(), "B".into()],
            rate_limit_marker: Some("BLOCK".into()),
        });
        let plugin = Arc::new(Scripted::with_metadata(
            Behavior::Rotating {
                good: "nowhere",
                marker: "BLOCK",
            },
            metadata,
        ));
        let dyn_plugin = as_plugin(&plugin);

        let invocation = invoker().invoke(&dyn_plugin, "8.8.8.8", "").await;

        assert_eq!(invocation, Invocation::Failed(PluginResult::failure(RETRY_EXHAUSTED)));
        assert_eq!(plugin.calls(), 20);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_non_retryable_failures() {
        let metadata = PluginMetadata::new("x").with_retry(RetryDeclaration::default());
        let plugin = Arc::new(Scripted::with_metadata(Behavior::Error, metadata));
        let dyn_plugin = as_plugin(&plugin);

        let invocation = invoker().invoke(&dyn_plugin, "8.8.8.8", "").await;

        assert!(invocation.is_failure());
        assert_eq!(plugin.calls(), 1);
    }
}
