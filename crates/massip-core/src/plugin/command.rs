use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;

use super::manifest::{OutputTransform, PluginManifest, SuccessRule};
use super::{
    Plugin, PluginCall, PluginError, PluginMetadata, PluginOutcome, PluginOutput, PluginResult,
};
use crate::config::ConfigResult;

pub(super) const ENTITY: &str = "{entity}";
pub(super) const PARAMETER: &str = "{parameter}";
pub(super) const ENDPOINT: &str = "{endpoint}";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit status and merged output of one external command. A non-zero exit is
/// not a failure by itself; the plugin's success rule decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_status: Option<i32>,
    pub output: String,
}

impl CommandOutcome {
    pub fn new(exit_status: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            exit_status,
            output: output.into(),
        }
    }

    pub const fn exited_cleanly(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }

    fn from_output(output: &Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let merged = match (stdout.trim(), stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        };

        Self {
            exit_status: output.status.code(),
            output: merged,
        }
    }

    fn describe_exit(&self) -> String {
        self.exit_status
            .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"))
    }
}

/// Runs programs directly (no shell) with an optional environment overlay.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    env: BTreeMap<String, String>,
}

impl CommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// The child is killed if the returned future is dropped, so an attempt
    /// that times out does not leave the process behind.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutcome, CommandError> {
        let output = Command::new(program)
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CommandError::NotFound(program.to_string()),
                _ => CommandError::Io(e),
            })?;

        Ok(CommandOutcome::from_output(&output))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ArgTemplate {
    /// Expands to the whitespace-split parameter, possibly nothing.
    Parameter,
    /// A single argument with `{entity}` / `{endpoint}` substituted.
    Text(String),
}

/// A plugin backed by an external program, described by a [`PluginManifest`].
#[derive(Debug)]
pub struct CommandPlugin {
    name: String,
    metadata: PluginMetadata,
    program: String,
    args: Vec<ArgTemplate>,
    success: SuccessRule,
    failure_markers: Vec<String>,
    output: OutputTransform,
    runner: CommandRunner,
}

impl CommandPlugin {
    pub(super) fn from_parts(
        name: String,
        metadata: PluginMetadata,
        program: String,
        args: Vec<ArgTemplate>,
    ) -> Self {
        Self {
            name,
            metadata,
            program,
            args,
            success: SuccessRule::default(),
            failure_markers: Vec::new(),
            output: OutputTransform::default(),
            runner: CommandRunner::new(),
        }
    }

    #[must_use]
    pub(super) const fn with_success_rule(mut self, success: SuccessRule) -> Self {
        self.success = success;
        self
    }

    #[must_use]
    pub(super) fn with_failure_markers(mut self, markers: Vec<String>) -> Self {
        self.failure_markers = markers;
        self
    }

    #[must_use]
    pub(super) fn with_output(mut self, output: OutputTransform) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub(super) fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        PluginManifest::load(path)?.into_plugin()
    }

    fn render_args(&self, call: &PluginCall) -> Result<Vec<String>, PluginError> {
        let mut args = Vec::with_capacity(self.args.len());

        for template in &self.args {
            match template {
                ArgTemplate::Parameter => {
                    args.extend(call.parameter.split_whitespace().map(String::from));
                }
                ArgTemplate::Text(text) => {
                    let mut arg = text.clone();
                    if arg.contains(ENDPOINT) {
                        let endpoint = call.endpoint.as_deref().ok_or_else(|| {
                            PluginError::Failed(format!("{} requires an endpoint", self.name))
                        })?;
                        arg = arg.replace(ENDPOINT, endpoint);
                    }
                    args.push(arg.replace(ENTITY, &call.entity));
                }
            }
        }

        Ok(args)
    }

    fn rate_limit_marker(&self) -> Option<&str> {
        self.metadata
            .retry
            .as_ref()
            .and_then(|r| r.rate_limit_marker.as_deref())
    }

    /// Apply the rate-limit marker, success rule, failure markers and output
    /// transform to a finished command.
    pub fn interpret(
        &self,
        entity: &str,
        outcome: &CommandOutcome,
    ) -> Result<PluginResult, PluginError> {
        if let Some(marker) = self.rate_limit_marker() {
            if outcome.output.contains(marker) {
                return Err(PluginError::RateLimited(format!(
                    "'{marker}' found in {} output",
                    self.program
                )));
            }
        }

        if !self.success.accepts(outcome) {
            return Err(PluginError::Process(format!(
                "{} exited with {}: {}",
                self.program,
                outcome.describe_exit(),
                outcome.output
            )));
        }

        let success = !self
            .failure_markers
            .iter()
            .any(|marker| outcome.output.contains(marker.as_str()));

        Ok(PluginResult {
            success,
            output: self.output.apply(entity, &outcome.output),
        })
    }
}

#[async_trait::async_trait]
impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn invoke(&self, call: &PluginCall) -> PluginOutcome {
        if call.entity.starts_with('-') {
            return Err(PluginError::Failed(format!(
                "refusing to pass option-like entity '{}' to {}",
                call.entity, self.program
            )));
        }

        let args = self.render_args(call)?;
        tracing::debug!(plugin = %self.name, program = %self.program, ?args, "executing command");

        let outcome = self
            .runner
            .run(&self.program, &args)
            .await
            .map_err(|e| PluginError::Process(e.to_string()))?;

        self.interpret(&call.entity, &outcome)
            .map(PluginOutput::Structured)
    }
}
