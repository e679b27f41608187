//! TOML workflow definitions.
//!
//! A file holds:
//! - `[runtime]` settings (agent log retention, job drain cap)
//! - `[[agents]]` with their type, schedule and options
//! - `[[links]]` and `[[control_links]]` between agents, by name
//!
//! Only the file's shape is checked here. Everything agent-specific is
//! validated when the resulting [`WorkflowBuilder`] is built.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::logs::DEFAULT_LOG_LENGTH;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::workflow::{AgentSpec, Workflow, WorkflowBuilder, WorkflowError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    /// Log entries kept per agent.
    #[serde(default = "default_agent_log_length")]
    pub agent_log_length: usize,

    /// Jobs one `work_off` call runs at most.
    #[serde(default = "default_max_jobs_per_drain")]
    pub max_jobs_per_drain: usize,
}

const fn default_agent_log_length() -> usize {
    DEFAULT_LOG_LENGTH
}

const fn default_max_jobs_per_drain() -> usize {
    10_000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            agent_log_length: default_agent_log_length(),
            max_jobs_per_drain: default_max_jobs_per_drain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    /// Schedule name. Omitted means the type's default.
    #[serde(default)]
    pub schedule: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Seconds created messages are kept. Zero keeps them forever.
    #[serde(default)]
    pub keep_messages_for: u64,

    #[serde(default)]
    pub propagate_immediately: bool,

    /// Omitted means the type's default options.
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

impl From<AgentConfig> for AgentSpec {
    fn from(config: AgentConfig) -> Self {
        let mut spec = AgentSpec::new(config.name, config.type_name)
            .disabled(config.disabled)
            .keep_messages_for(config.keep_messages_for)
            .propagate_immediately(config.propagate_immediately);
        spec.schedule = config.schedule;
        spec.options = config.options;
        spec
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    pub source: String,
    pub receiver: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlLinkConfig {
    pub controller: String,
    pub target: String,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_name")]
    pub name: String,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub links: Vec<LinkConfig>,

    #[serde(default)]
    pub control_links: Vec<ControlLinkConfig>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

impl WorkflowConfig {
    /// Load a definition from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load a definition from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: WorkflowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.agent_log_length == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.agent_log_length must be at least 1".into(),
            ));
        }
        if self.runtime.max_jobs_per_drain == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_jobs_per_drain must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// A builder for this definition, resolving types against `registry`.
    pub fn into_builder(self, registry: Registry) -> WorkflowBuilder {
        let mut builder = Workflow::builder(self.name)
            .registry(registry)
            .agent_log_length(self.runtime.agent_log_length);
        for agent in self.agents {
            builder = builder.agent(agent.into());
        }
        for link in self.links {
            builder = builder.link(link.source, link.receiver);
        }
        for link in self.control_links {
            builder = builder.control(link.controller, link.target);
        }
        builder
    }

    /// Build the workflow and wrap it in a runner honouring `[runtime]`.
    pub fn into_runner(self, registry: Registry) -> Result<Runner, ConfigError> {
        let max_jobs = self.runtime.max_jobs_per_drain;
        let workflow = self.into_builder(registry).build()?;
        Ok(Runner::new(workflow).with_max_jobs(max_jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Interval, Schedule};
    use serde_json::json;
    use std::io::Write;

    const FEED: &str = r#"
name = "prices"

[runtime]
agent_log_length = 50

[[agents]]
name = "feed"
type = "emitter"
schedule = "every_5m"
keep_messages_for = 3600

[agents.options.payload]
price = 10

[[agents]]
name = "sorted"
type = "digest"
propagate_immediately = true

[agents.options]
messages_order = [["{{ price }}", "number", false]]

[[agents]]
name = "boss"
type = "commander"
schedule = "midnight"

[agents.options]
action = "disable"

[[links]]
source = "feed"
receiver = "sorted"

[[control_links]]
controller = "boss"
target = "feed"
"#;

    #[test]
    fn parse_minimal_config() -> Result<(), Box<dyn std::error::Error>> {
        let config = WorkflowConfig::parse("")?;
        assert_eq!(config.name, "workflow");
        assert_eq!(config.runtime, RuntimeSettings::default());
        assert!(config.agents.is_empty());
        Ok(())
    }

    #[test]
    fn parse_full_config() -> Result<(), Box<dyn std::error::Error>> {
        let config = WorkflowConfig::parse(FEED)?;
        assert_eq!(config.runtime.agent_log_length, 50);
        assert_eq!(config.runtime.max_jobs_per_drain, 10_000);
        assert_eq!(config.agents.len(), 3);
        assert_eq!(config.agents[0].options, Some(json!({"payload": {"price": 10}}).as_object().cloned().unwrap_or_default()));
        assert_eq!(config.agents[1].options.as_ref().unwrap()["messages_order"], json!([["{{ price }}", "number", false]]));
        assert_eq!(config.links[0], LinkConfig { source: "feed".into(), receiver: "sorted".into() });
        Ok(())
    }

    #[test]
    fn builds_a_runner() -> Result<(), Box<dyn std::error::Error>> {
        let runner = WorkflowConfig::parse(FEED)?.into_runner(Registry::with_builtins())?;
        let wf = runner.workflow();
        assert_eq!(wf.name(), "prices");

        let feed = wf.agent_by_name("feed")?;
        assert_eq!(feed.schedule, Schedule::Every(Interval::FiveMinutes));
        assert_eq!(feed.keep_messages_for, 3600);

        let boss = wf.agent_by_name("boss")?;
        assert_eq!(wf.agents().control_targets(boss.id)?, vec![feed.id]);
        Ok(())
    }

    #[test]
    fn zero_log_length_is_rejected() {
        let err = WorkflowConfig::parse("[runtime]\nagent_log_length = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = WorkflowConfig::parse("[[agents]\nname = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn agent_problems_surface_at_build_time() -> Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
[[agents]]
name = "boss"
type = "commander"

[agents.options]
action = "explode"
"#;
        let config = WorkflowConfig::parse(toml)?;
        let err = config.into_runner(Registry::with_builtins()).err().unwrap();
        assert!(matches!(err, ConfigError::Workflow(WorkflowError::Invalid { .. })));
        Ok(())
    }

    #[test]
    fn loads_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(FEED.as_bytes())?;
        let config = WorkflowConfig::from_file(file.path())?;
        assert_eq!(config.agents[2].name, "boss");
        Ok(())
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkflowConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
