use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::{
    ArgTemplate, CommandOutcome, CommandPlugin, CommandRunner, ENDPOINT, ENTITY, PARAMETER,
};
use super::{PluginMetadata, RetryDeclaration};
use crate::config::{load_definition, ConfigError, ConfigResult};

/// How a command's exit status maps onto success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessRule {
    /// Any exit status is a valid answer (a failed ping is a "DOWN" result).
    Always,
    /// A non-zero exit is a process error.
    #[default]
    ExitStatus,
}

impl SuccessRule {
    pub const fn accepts(self, outcome: &CommandOutcome) -> bool {
        match self {
            Self::Always => true,
            Self::ExitStatus => outcome.exited_cleanly(),
        }
    }
}

/// Post-processing applied to command output before it lands in a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputTransform {
    #[default]
    Raw,
    /// Remove every occurrence of each prefix.
    Strip { prefixes: Vec<String> },
    /// Collapse output to an up/down verdict.
    Reachability {
        up_marker: String,
        #[serde(default = "default_up")]
        up: String,
        #[serde(default = "default_down")]
        down: String,
    },
    /// Keep `key: value` lines mentioning one of `keys`, dropping comment lines.
    FieldLines {
        keys: Vec<String>,
        #[serde(default)]
        ignore: Vec<String>,
        #[serde(default = "default_fallback")]
        fallback: String,
    },
}

fn default_up() -> String {
    format!("{ENTITY}: UP")
}

fn default_down() -> String {
    format!("{ENTITY}: DOWN")
}

fn default_fallback() -> String {
    "No matching fields found".to_string()
}

impl OutputTransform {
    pub fn apply(&self, entity: &str, raw: &str) -> String {
        match self {
            Self::Raw => raw.to_string(),
            Self::Strip { prefixes } => prefixes
                .iter()
                .fold(raw.to_string(), |text, prefix| text.replace(prefix.as_str(), ""))
                .trim()
                .to_string(),
            Self::Reachability { up_marker, up, down } => {
                let verdict = if raw.contains(up_marker.as_str()) { up } else { down };
                verdict.replace(ENTITY, entity)
            }
            Self::FieldLines {
                keys,
                ignore,
                fallback,
            } => {
                let lines: Vec<String> = raw
                    .lines()
                    .filter(|line| keys.iter().any(|k| line.contains(k.as_str())))
                    .filter(|line| !ignore.iter().any(|m| line.contains(m.as_str())))
                    .filter(|line| line.contains(':'))
                    .map(|line| line.split(':').map(str::trim).collect::<Vec<_>>().join(":"))
                    .collect();

                if lines.is_empty() {
                    fallback.clone()
                } else {
                    lines.join("\n")
                }
            }
        }
    }

    fn validate(&self, name: &str) -> ConfigResult<()> {
        match self {
            Self::Raw => Ok(()),
            Self::Strip { prefixes } if prefixes.iter().any(String::is_empty) => {
                Err(ConfigError::invalid(name, "strip prefixes must not be empty"))
            }
            Self::Reachability { up_marker, .. } if up_marker.is_empty() => {
                Err(ConfigError::invalid(name, "reachability up_marker is empty"))
            }
            Self::FieldLines { keys, .. }
                if keys.is_empty() || keys.iter().any(String::is_empty) =>
            {
                Err(ConfigError::invalid(name, "field_lines needs non-empty keys"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub rate_limit_marker: Option<String>,
}

/// On-disk description of a command-backed plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub default_parameter: String,
    #[serde(default)]
    pub success: SuccessRule,
    #[serde(default)]
    pub failure_markers: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_network_facing")]
    pub network_facing: bool,
    #[serde(default)]
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub output: OutputTransform,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_args() -> Vec<String> {
    vec![PARAMETER.to_string(), ENTITY.to_string()]
}

const fn default_network_facing() -> bool {
    true
}

/// Contents of every `{...}` in `arg`.
fn placeholders(arg: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else { break };
        found.push(&after[..end]);
        rest = &after[end + 1..];
    }
    found
}

impl PluginManifest {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_definition(path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid("<unnamed plugin>", "name is empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid(name, "name must not contain whitespace"));
        }
        if self.program.trim().is_empty() {
            return Err(ConfigError::invalid(name, "program is empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::invalid(name, "timeout_secs must be positive"));
        }

        let mut uses_entity = false;
        let mut uses_endpoint = false;
        for arg in &self.args {
            for placeholder in placeholders(arg) {
                match placeholder {
                    "entity" => uses_entity = true,
                    "endpoint" => uses_endpoint = true,
                    "parameter" if arg == PARAMETER => {}
                    "parameter" => {
                        return Err(ConfigError::invalid(
                            name,
                            "{parameter} must be a whole argument",
                        ))
                    }
                    other => {
                        return Err(ConfigError::invalid(
                            name,
                            format!("unknown placeholder {{{other}}}"),
                        ))
                    }
                }
            }
        }
        if !uses_entity {
            return Err(ConfigError::invalid(name, "args never reference {entity}"));
        }

        let endpoints = self.retry.as_ref().map_or(&[][..], |r| r.endpoints.as_slice());
        if uses_endpoint && endpoints.is_empty() {
            return Err(ConfigError::invalid(
                name,
                format!("{ENDPOINT} used without retry endpoints"),
            ));
        }
        if !uses_endpoint && !endpoints.is_empty() {
            return Err(ConfigError::invalid(
                name,
                format!("retry endpoints declared but args never use {ENDPOINT}"),
            ));
        }
        if endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ConfigError::invalid(name, "blank retry endpoint"));
        }
        if let Some(retry) = &self.retry {
            if retry.rate_limit_marker.as_deref() == Some("") {
                return Err(ConfigError::invalid(name, "rate_limit_marker is empty"));
            }
        }
        if self.failure_markers.iter().any(String::is_empty) {
            return Err(ConfigError::invalid(name, "failure marker is empty"));
        }

        self.output.validate(name)
    }

    pub fn into_plugin(self) -> ConfigResult<CommandPlugin> {
        self.validate()?;

        let args = self
            .args
            .into_iter()
            .map(|arg| {
                if arg == PARAMETER {
                    ArgTemplate::Parameter
                } else {
                    ArgTemplate::Text(arg)
                }
            })
            .collect();

        let mut metadata = PluginMetadata::new(self.description)
            .with_default_parameter(self.default_parameter)
            .with_network_facing(self.network_facing);
        if let Some(retry) = self.retry {
            metadata = metadata.with_retry(RetryDeclaration {
                endpoints: retry.endpoints,
                rate_limit_marker: retry.rate_limit_marker,
            });
        }
        if let Some(secs) = self.timeout_secs {
            metadata = metadata.with_timeout(Duration::from_secs(secs));
        }

        Ok(
            CommandPlugin::from_parts(self.name.trim().to_string(), metadata, self.program, args)
                .with_success_rule(self.success)
                .with_failure_markers(self.failure_markers)
                .with_output(self.output)
                .with_runner(CommandRunner::new().with_env(self.env)),
        )
    }
}
