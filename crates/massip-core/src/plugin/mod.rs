//! The plugin contract: one named unit invoked once per (entity, plugin) pair.

mod builtin;
mod command;
mod manifest;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use builtin::EchoPlugin;
pub use command::{CommandError, CommandOutcome, CommandPlugin, CommandRunner};
pub use manifest::{OutputTransform, PluginManifest, RetrySection, SuccessRule};

/// The canonical result every invocation ends in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    pub output: String,
}

impl PluginResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// The shapes a plugin may hand back. The invoker normalizes all of them into a
/// [`PluginResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOutput {
    Text(String),
    Structured(PluginResult),
    Json(serde_json::Value),
}

impl PluginOutput {
    /// `None` when the value does not carry a usable result. JSON objects need a
    /// boolean `success` plus an `output` (or legacy `result`) member.
    pub fn normalize(self) -> Option<PluginResult> {
        match self {
            Self::Text(text) => Some(PluginResult::success(text)),
            Self::Structured(result) => Some(result),
            Self::Json(serde_json::Value::String(text)) => Some(PluginResult::success(text)),
            Self::Json(serde_json::Value::Object(map)) => {
                let success = map.get("success")?.as_bool()?;
                let output = map.get("output").or_else(|| map.get("result"))?;
                let output = match output {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                Some(PluginResult { success, output })
            }
            Self::Json(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("process error: {0}")]
    Process(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Process(_) | Self::Transport(_) | Self::RateLimited(_))
    }
}

pub type PluginOutcome = Result<PluginOutput, PluginError>;

/// Interchangeable endpoints an operation may be rotated across, and the token
/// that marks a rate-limited response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryDeclaration {
    pub endpoints: Vec<String>,
    pub rate_limit_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub description: String,
    pub default_parameter: String,
    /// Network or process affecting; such plugins are never run against
    /// non-public addresses.
    pub network_facing: bool,
    pub retry: Option<RetryDeclaration>,
    pub timeout: Option<Duration>,
}

impl Default for PluginMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            default_parameter: String::new(),
            network_facing: true,
            retry: None,
            timeout: None,
        }
    }
}

impl PluginMetadata {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.default_parameter = parameter.into();
        self
    }

    #[must_use]
    pub const fn with_network_facing(mut self, network_facing: bool) -> Self {
        self.network_facing = network_facing;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryDeclaration) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One call into a plugin. `endpoint` is set when the plugin declares
/// interchangeable endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCall {
    pub entity: String,
    pub parameter: String,
    pub endpoint: Option<String>,
}

impl PluginCall {
    pub fn new(entity: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            parameter: parameter.into(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }
}

/// Plugins are stateless with respect to a batch: invocations are independent
/// and may run in any order relative to each other.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn metadata(&self) -> &PluginMetadata;

    async fn invoke(&self, call: &PluginCall) -> PluginOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_text() {
        let result = PluginOutput::Text("up".into()).normalize().unwrap();
        assert_eq!(result, PluginResult::success("up"));
    }

    #[test]
    fn test_normalize_json_shapes() {
        let modern = PluginOutput::Json(json!({"success": false, "output": "down"}));
        assert_eq!(modern.normalize(), Some(PluginResult::failure("down")));

        let legacy = PluginOutput::Json(json!({"success": true, "result": "NL"}));
        assert_eq!(legacy.normalize(), Some(PluginResult::success("NL")));

        let nested = PluginOutput::Json(json!({"success": true, "output": {"asn": 3320}}));
        assert_eq!(nested.normalize(), Some(PluginResult::success(r#"{"asn":3320}"#)));

        let bare = PluginOutput::Json(json!("plain"));
        assert_eq!(bare.normalize(), Some(PluginResult::success("plain")));
    }

    #[test]
    fn test_normalize_rejects_non_conforming() {
        assert!(PluginOutput::Json(json!(42)).normalize().is_none());
        assert!(PluginOutput::Json(json!(["a"])).normalize().is_none());
        assert!(PluginOutput::Json(json!({"output": "x"})).normalize().is_none());
        assert!(PluginOutput::Json(json!({"success": "yes", "output": "x"})).normalize().is_none());
        assert!(PluginOutput::Json(json!({"success": true})).normalize().is_none());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PluginError::Process("x".into()).is_retryable());
        assert!(PluginError::Transport("x".into()).is_retryable());
        assert!(PluginError::RateLimited("x".into()).is_retryable());
        assert!(!PluginError::Failed("x".into()).is_retryable());
    }

    #[test]
    fn test_metadata_builders() {
        let meta = PluginMetadata::new("lookup")
            .with_default_parameter("-c 1")
            .with_network_facing(false)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(meta.description, "lookup");
        assert_eq!(meta.default_parameter, "-c 1");
        assert!(!meta.network_facing);
        assert_eq!(meta.timeout, Some(Duration::from_secs(5)));
        assert!(PluginMetadata::default().network_facing);
    }
}
