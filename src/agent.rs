use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ctx::Ctx;
use crate::dry_run::DryRunCapture;
use crate::error::{AgentError, InvokeResult, ValidationErrors};
use crate::message::{Message, MessageId};
use crate::schedule::Schedule;
use crate::workflow::Workflow;

pub type AgentId = u64;

/// What an agent type is allowed to do. Computed once per type and attached
/// to its registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_be_scheduled: bool,
    pub can_receive: bool,
    pub can_create_messages: bool,
    pub can_control_others: bool,
    pub can_dry_run: bool,
    /// Emissions go through the ordering engine when `messages_order` is set.
    pub can_order_messages: bool,
}

impl Capabilities {
    /// Schedulable, receives and creates messages. Nothing else.
    pub const fn new() -> Self {
        Self {
            can_be_scheduled: true,
            can_receive: true,
            can_create_messages: true,
            can_control_others: false,
            can_dry_run: false,
            can_order_messages: false,
        }
    }

    pub const fn cannot_be_scheduled(self) -> Self {
        Self {
            can_be_scheduled: false,
            ..self
        }
    }

    pub const fn cannot_receive(self) -> Self {
        Self {
            can_receive: false,
            ..self
        }
    }

    pub const fn cannot_create_messages(self) -> Self {
        Self {
            can_create_messages: false,
            ..self
        }
    }

    pub const fn controls_others(self) -> Self {
        Self {
            can_control_others: true,
            ..self
        }
    }

    pub const fn dry_runnable(self) -> Self {
        Self {
            can_dry_run: true,
            ..self
        }
    }

    pub const fn sortable(self) -> Self {
        Self {
            can_order_messages: true,
            ..self
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

/// The behavior behind an agent type.
///
/// Implementations are stateless: everything an agent remembers between
/// invocations lives in its [`AgentRecord::memory`], reached through the
/// [`Ctx`] handed to `check` and `receive`.
pub trait AgentBehavior: Send + Sync + 'static {
    /// The type tag agents of this behavior are registered under.
    fn type_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    /// Options given to a new agent configured without any.
    fn default_options(&self) -> Map<String, Value> {
        Map::new()
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::Never
    }

    /// Configuration-time checks. Attach problems to the offending field.
    fn validate_options(&self, _options: &Map<String, Value>, _errors: &mut ValidationErrors) {}

    /// Scheduled invocation.
    fn check(&self, _ctx: &mut Ctx<'_>) -> InvokeResult {
        Ok(())
    }

    /// Reactive invocation with messages ordered by ascending id.
    fn receive(&self, _ctx: &mut Ctx<'_>, _messages: &[Message]) -> InvokeResult {
        Ok(())
    }
}

/// The persisted shape of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub user_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub schedule: Schedule,
    pub disabled: bool,
    pub options: Map<String, Value>,
    pub memory: Map<String, Value>,
    /// Highest message id already handed to this agent.
    pub last_checked_message_id: MessageId,
    /// Seconds a created message lives for. Zero keeps it forever.
    pub keep_messages_for: u64,
    pub propagate_immediately: bool,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_receive_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id: 0,
            name: name.into(),
            type_name: type_name.into(),
            schedule: Schedule::Never,
            disabled: false,
            options: Map::new(),
            memory: Map::new(),
            last_checked_message_id: 0,
            keep_messages_for: 0,
            propagate_immediately: false,
            last_check_at: None,
            last_receive_at: None,
            last_message_at: None,
        }
    }
}

/// A loaded agent: its record paired with the behavior its type resolves to.
pub struct Agent {
    pub(crate) record: AgentRecord,
    pub(crate) behavior: Arc<dyn AgentBehavior>,
    pub(crate) capabilities: Capabilities,
    /// Present only while a dry run is in progress.
    pub(crate) sandbox: Option<DryRunCapture>,
}

impl Agent {
    pub fn new(record: AgentRecord, behavior: Arc<dyn AgentBehavior>) -> Self {
        let capabilities = behavior.capabilities();
        Self {
            record,
            behavior,
            capabilities,
            sandbox: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.record.id
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut AgentRecord {
        &mut self.record
    }

    pub fn into_record(self) -> AgentRecord {
        self.record
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_dry_run(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Run the behavior's `check`, returning the ids of stored messages.
    pub fn check(&mut self, workflow: &Workflow) -> Result<Vec<MessageId>, AgentError> {
        let behavior = Arc::clone(&self.behavior);
        let mut ctx = self.ctx(workflow);
        behavior.check(&mut ctx)?;
        Ok(ctx.into_emitted())
    }

    /// Run the behavior's `receive`, returning the ids of stored messages.
    pub fn receive(
        &mut self,
        workflow: &Workflow,
        messages: &[Message],
    ) -> Result<Vec<MessageId>, AgentError> {
        if !self.capabilities.can_receive {
            return Err(AgentError::cannot_receive_messages());
        }
        let behavior = Arc::clone(&self.behavior);
        let mut ctx = self.ctx(workflow);
        behavior.receive(&mut ctx, messages)?;
        Ok(ctx.into_emitted())
    }

    fn ctx<'a>(&'a mut self, workflow: &'a Workflow) -> Ctx<'a> {
        Ctx::new(
            &mut self.record,
            self.capabilities,
            self.sandbox.as_mut(),
            workflow,
        )
    }
}
