use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::{Agent, AgentId, AgentRecord, Capabilities};
use crate::control;
use crate::error::{AgentError, StoreError, ValidationErrors};
use crate::jobs::JobQueue;
use crate::logs::{AgentLogs, DEFAULT_LOG_LENGTH};
use crate::registry::Registry;
use crate::schedule::Schedule;
use crate::store::{AgentStore, ControlLink, Link, MemoryAgentStore, MemoryMessageStore, MessageStore};
use crate::template::{Interpolator, JinjaInterpolator};

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent '{agent}' has unknown type '{type_name}'")]
    UnknownType { agent: String, type_name: String },

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error("agent '{agent}' is invalid: {errors}")]
    Invalid { agent: String, errors: ValidationErrors },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// AgentSpec
// ---------------------------------------------------------------------------

/// User configuration for one agent, before defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub name: String,
    pub type_name: String,
    pub schedule: Option<String>,
    pub disabled: bool,
    pub keep_messages_for: u64,
    pub propagate_immediately: bool,
    /// `None` takes the type's default options.
    pub options: Option<Map<String, Value>>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            schedule: None,
            disabled: false,
            keep_messages_for: 0,
            propagate_immediately: false,
            options: None,
        }
    }

    /// Accepts a [`Schedule`] or its name, e.g. `"every_5m"`.
    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn keep_messages_for(mut self, seconds: u64) -> Self {
        self.keep_messages_for = seconds;
        self
    }

    pub fn propagate_immediately(mut self, propagate: bool) -> Self {
        self.propagate_immediately = propagate;
        self
    }

    /// Options as a JSON object. Anything else is treated as empty.
    pub fn options(mut self, options: Value) -> Self {
        self.options = Some(match options {
            Value::Object(map) => map,
            _ => Map::new(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

pub struct WorkflowBuilder {
    name: String,
    registry: Registry,
    agents: Vec<AgentSpec>,
    links: Vec<(String, String)>,
    control_links: Vec<(String, String)>,
    message_store: Option<Box<dyn MessageStore>>,
    agent_store: Option<Box<dyn AgentStore>>,
    interpolator: Option<Box<dyn Interpolator>>,
    log_length: usize,
}

impl WorkflowBuilder {
    /// Replace the built-in agent types.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn agent(mut self, spec: AgentSpec) -> Self {
        self.agents.push(spec);
        self
    }

    /// `receiver` consumes the messages `source` creates from now on.
    pub fn link(mut self, source: impl Into<String>, receiver: impl Into<String>) -> Self {
        self.links.push((source.into(), receiver.into()));
        self
    }

    /// `controller` may apply lifecycle actions to `target`. Targets are
    /// processed in the order they are declared here.
    pub fn control(mut self, controller: impl Into<String>, target: impl Into<String>) -> Self {
        self.control_links.push((controller.into(), target.into()));
        self
    }

    pub fn message_store(mut self, store: impl MessageStore + 'static) -> Self {
        self.message_store = Some(Box::new(store));
        self
    }

    pub fn agent_store(mut self, store: impl AgentStore + 'static) -> Self {
        self.agent_store = Some(Box::new(store));
        self
    }

    pub fn interpolator(mut self, interpolator: impl Interpolator + 'static) -> Self {
        self.interpolator = Some(Box::new(interpolator));
        self
    }

    /// Log entries kept per agent.
    pub fn agent_log_length(mut self, length: usize) -> Self {
        self.log_length = length;
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let workflow = Workflow {
            name: self.name,
            registry: self.registry,
            messages: self
                .message_store
                .unwrap_or_else(|| Box::new(MemoryMessageStore::new())),
            agents: self
                .agent_store
                .unwrap_or_else(|| Box::new(MemoryAgentStore::new())),
            interpolator: self
                .interpolator
                .unwrap_or_else(|| Box::new(JinjaInterpolator::new())),
            logs: AgentLogs::new(self.log_length),
            jobs: JobQueue::new(),
        };

        // Insert every agent first so control validation can see its targets.
        let mut ids: HashMap<String, AgentId> = HashMap::new();
        for spec in self.agents {
            if ids.contains_key(&spec.name) {
                return Err(WorkflowError::DuplicateAgent(spec.name));
            }
            let name = spec.name.clone();
            let record = workflow.agents.insert(workflow.prepare(spec)?)?;
            ids.insert(name, record.id);
        }

        let lookup = |name: &str| {
            ids.get(name)
                .copied()
                .ok_or_else(|| WorkflowError::UnknownAgent(name.to_string()))
        };
        for (source, receiver) in &self.links {
            workflow.link(lookup(source.as_str())?, lookup(receiver.as_str())?)?;
        }
        for (controller, target) in &self.control_links {
            workflow.add_control_link(lookup(controller.as_str())?, lookup(target.as_str())?)?;
        }

        for record in workflow.agents.all()? {
            workflow.ensure_valid(&record)?;
        }
        tracing::debug!(workflow = %workflow.name, agents = ids.len(), "workflow built");
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// Workflow (validated, only constructed via build())
// ---------------------------------------------------------------------------

/// A graph of agents with the stores and services they run against.
pub struct Workflow {
    name: String,
    registry: Registry,
    messages: Box<dyn MessageStore>,
    agents: Box<dyn AgentStore>,
    interpolator: Box<dyn Interpolator>,
    logs: AgentLogs,
    jobs: JobQueue,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            registry: Registry::with_builtins(),
            agents: Vec::new(),
            links: Vec::new(),
            control_links: Vec::new(),
            message_store: None,
            agent_store: None,
            interpolator: None,
            log_length: DEFAULT_LOG_LENGTH,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn messages(&self) -> &dyn MessageStore {
        self.messages.as_ref()
    }

    pub fn agents(&self) -> &dyn AgentStore {
        self.agents.as_ref()
    }

    pub fn interpolator(&self) -> &dyn Interpolator {
        self.interpolator.as_ref()
    }

    pub fn logs(&self) -> &AgentLogs {
        &self.logs
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    // --- lookups ---

    pub fn agent(&self, id: AgentId) -> Result<AgentRecord, StoreError> {
        self.agents.get(id)
    }

    pub fn agent_by_name(&self, name: &str) -> Result<AgentRecord, WorkflowError> {
        self.agents
            .find_by_name(name)?
            .ok_or_else(|| WorkflowError::UnknownAgent(name.to_string()))
    }

    /// Load an agent ready to be invoked.
    pub fn load(&self, id: AgentId) -> Result<Agent, AgentError> {
        let record = self.agents.get(id)?;
        let behavior = self
            .registry
            .resolve(&record.type_name)
            .ok_or_else(|| AgentError::UnknownType(record.type_name.clone()))?;
        Ok(Agent::new(record, behavior))
    }

    fn capabilities(&self, record: &AgentRecord) -> Result<Capabilities, AgentError> {
        self.registry
            .capabilities(&record.type_name)
            .ok_or_else(|| AgentError::UnknownType(record.type_name.clone()))
    }

    // --- validation ---

    /// Configuration-time checks for `record`, attached to option fields.
    /// The outer error means the record could not be checked at all.
    pub fn validate_record(&self, record: &AgentRecord) -> Result<ValidationErrors, AgentError> {
        let behavior = self
            .registry
            .resolve(&record.type_name)
            .ok_or_else(|| AgentError::UnknownType(record.type_name.clone()))?;
        let caps = behavior.capabilities();

        let mut errors = ValidationErrors::new();
        if !caps.can_be_scheduled && record.schedule.is_scheduled() {
            errors.add("schedule", "must be 'never' for agents that cannot be scheduled");
        }
        behavior.validate_options(&record.options, &mut errors);

        if caps.can_control_others {
            let mut targets = Vec::new();
            if record.id != 0 {
                for id in self.agents.control_targets(record.id)? {
                    let target = if id == record.id {
                        record.clone()
                    } else {
                        self.agents.get(id)?
                    };
                    let target_caps = self.capabilities(&target)?;
                    targets.push((target, target_caps));
                }
            }
            let targets: Vec<(&AgentRecord, Capabilities)> =
                targets.iter().map(|(r, c)| (r, *c)).collect();
            control::validate_options(&record.options, &targets, &mut errors);
        }
        Ok(errors)
    }

    fn ensure_valid(&self, record: &AgentRecord) -> Result<(), WorkflowError> {
        let errors = self.validate_record(record).map_err(|e| match e {
            AgentError::UnknownType(type_name) => WorkflowError::UnknownType {
                agent: record.name.clone(),
                type_name,
            },
            other => WorkflowError::Agent(other),
        })?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Invalid {
                agent: record.name.clone(),
                errors,
            })
        }
    }

    /// Turn an `AgentSpec` into a record: defaults applied, schedule forced to
    /// `never` for types that cannot be scheduled, watermark initialized to
    /// the current store maximum for types that receive.
    fn prepare(&self, spec: AgentSpec) -> Result<AgentRecord, WorkflowError> {
        let behavior = self
            .registry
            .resolve(&spec.type_name)
            .ok_or_else(|| WorkflowError::UnknownType {
                agent: spec.name.clone(),
                type_name: spec.type_name.clone(),
            })?;
        let caps = behavior.capabilities();

        let schedule = if !caps.can_be_scheduled {
            Schedule::Never
        } else {
            match spec.schedule.as_deref() {
                None => behavior.default_schedule(),
                Some(name) => name.parse::<Schedule>().map_err(|e| {
                    let mut errors = ValidationErrors::new();
                    errors.add("schedule", e.to_string());
                    WorkflowError::Invalid {
                        agent: spec.name.clone(),
                        errors,
                    }
                })?,
            }
        };

        let mut record = AgentRecord::new(spec.name, spec.type_name);
        record.schedule = schedule;
        record.disabled = spec.disabled;
        record.keep_messages_for = spec.keep_messages_for;
        record.propagate_immediately = spec.propagate_immediately;
        record.options = spec.options.unwrap_or_else(|| behavior.default_options());
        if caps.can_receive {
            record.last_checked_message_id = self.messages.max_id()?;
        }
        Ok(record)
    }

    // --- graph changes ---

    /// Add an agent to a running workflow.
    pub fn create_agent(&self, spec: AgentSpec) -> Result<AgentRecord, WorkflowError> {
        if self.agents.find_by_name(&spec.name)?.is_some() {
            return Err(WorkflowError::DuplicateAgent(spec.name));
        }
        let record = self.prepare(spec)?;
        self.ensure_valid(&record)?;
        let record = self.agents.insert(record)?;
        tracing::info!(agent_id = record.id, name = %record.name, "agent created");
        Ok(record)
    }

    /// Link `source` to `receiver`. Only messages created after this call are
    /// ever delivered through the link.
    pub fn link(&self, source: AgentId, receiver: AgentId) -> Result<Link, WorkflowError> {
        let source_record = self.agents.get(source)?;
        let receiver_record = self.agents.get(receiver)?;
        if !self.capabilities(&source_record)?.can_create_messages {
            return Err(WorkflowError::InvalidLink(format!(
                "'{}' cannot create messages",
                source_record.name
            )));
        }
        if !self.capabilities(&receiver_record)?.can_receive {
            return Err(WorkflowError::InvalidLink(format!(
                "'{}' cannot receive messages",
                receiver_record.name
            )));
        }

        let link = Link {
            source_id: source,
            receiver_id: receiver,
            message_id_at_creation: self.messages.max_id()?,
        };
        self.agents.add_link(link)?;
        Ok(link)
    }

    pub fn add_control_link(&self, controller: AgentId, target: AgentId) -> Result<ControlLink, WorkflowError> {
        let controller_record = self.agents.get(controller)?;
        let target_record = self.agents.get(target)?;
        if !self.capabilities(&controller_record)?.can_control_others {
            return Err(WorkflowError::InvalidLink(format!(
                "'{}' cannot control other agents",
                controller_record.name
            )));
        }

        let target_caps = self.capabilities(&target_record)?;
        let mut errors = ValidationErrors::new();
        control::validate_options(&controller_record.options, &[(&target_record, target_caps)], &mut errors);
        if !errors.is_empty() {
            return Err(WorkflowError::Invalid {
                agent: controller_record.name,
                errors,
            });
        }

        let link = ControlLink {
            controller_id: controller,
            target_id: target,
        };
        self.agents.add_control_link(link)?;
        Ok(link)
    }

    /// Replace an agent's options after validating them.
    pub fn update_options(&self, id: AgentId, options: Map<String, Value>) -> Result<AgentRecord, WorkflowError> {
        let mut record = self.agents.get(id)?;
        record.options = options;
        self.ensure_valid(&record)?;
        self.agents.set_options(id, record.options.clone())?;
        Ok(record)
    }

    pub fn set_disabled(&self, id: AgentId, disabled: bool) -> Result<AgentRecord, WorkflowError> {
        let mut record = self.agents.get(id)?;
        if record.disabled != disabled {
            record.disabled = disabled;
            self.agents.set_disabled(id, disabled)?;
        }
        Ok(record)
    }
}
