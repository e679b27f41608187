use chrono::{Duration, Utc};
use serde_json::{Map, Value};

use crate::agent::{AgentId, AgentRecord, Capabilities};
use crate::dry_run::DryRunCapture;
use crate::error::{AgentError, InvokeResult};
use crate::jobs::Job;
use crate::logs::{AgentLog, LogLevel};
use crate::message::MessageId;
use crate::ordering::{self, OrderSpec, SORT_INFO_KEY, SORT_INFO_OPTION};
use crate::template;
use crate::workflow::Workflow;

/// The setting of a control target a lifecycle action changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetChange {
    Disabled,
    Options,
}

/// Execution context for one `check` or `receive` call.
///
/// Behaviors emit messages, log, and read or mutate memory through this. In a
/// dry run the same calls land in the sandbox instead of the stores.
pub struct Ctx<'a> {
    record: &'a mut AgentRecord,
    capabilities: Capabilities,
    sandbox: Option<&'a mut DryRunCapture>,
    workflow: &'a Workflow,
    scopes: Vec<Map<String, Value>>,
    sort_buffer: Option<Vec<Value>>,
    emitted: Vec<MessageId>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        record: &'a mut AgentRecord,
        capabilities: Capabilities,
        sandbox: Option<&'a mut DryRunCapture>,
        workflow: &'a Workflow,
    ) -> Self {
        Self {
            record,
            capabilities,
            sandbox,
            workflow,
            scopes: Vec::new(),
            sort_buffer: None,
            emitted: Vec::new(),
        }
    }

    pub fn agent(&self) -> &AgentRecord {
        self.record
    }

    pub fn id(&self) -> AgentId {
        self.record.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.record.options
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.record.options.get(key)
    }

    pub fn memory(&self) -> &Map<String, Value> {
        &self.record.memory
    }

    pub fn memory_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.record.memory
    }

    pub fn is_dry_run(&self) -> bool {
        self.sandbox.is_some()
    }

    // --- logging ---

    pub fn log(&mut self, message: impl Into<String>) {
        self.log_at(LogLevel::Info, None, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log_at(LogLevel::Warn, None, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log_at(LogLevel::Error, None, message.into());
    }

    pub(crate) fn log_at(&mut self, level: LogLevel, target_id: Option<AgentId>, message: String) {
        match self.sandbox.as_deref_mut() {
            Some(sandbox) => sandbox.push_log(level, &message),
            None => self.workflow.logs().record(AgentLog {
                agent_id: self.record.id,
                level,
                message,
                target_id,
                created_at: Utc::now(),
            }),
        }
    }

    // --- interpolation ---

    /// Every variable currently in scope, innermost frames winning.
    pub fn scope(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for frame in &self.scopes {
            merged.extend(frame.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    /// Run `f` with `vars` added to the interpolation scope.
    pub fn with_scope<R>(&mut self, vars: Map<String, Value>, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scopes.push(vars);
        let out = f(self);
        self.scopes.pop();
        out
    }

    pub fn interpolate(&self, template: &str) -> Result<String, AgentError> {
        self.workflow
            .interpolator()
            .evaluate(template, &self.scope())
            .map_err(|e| AgentError::Template(e.to_string()))
    }

    pub fn interpolate_value(&self, value: &Value) -> Result<Value, AgentError> {
        template::interpolate_value(self.workflow.interpolator(), value, &self.scope())
            .map_err(|e| AgentError::Template(e.to_string()))
    }

    /// An option with every string inside it interpolated.
    pub fn interpolated_option(&self, key: &str) -> Result<Option<Value>, AgentError> {
        self.record
            .options
            .get(key)
            .map(|v| self.interpolate_value(v))
            .transpose()
    }

    // --- emission ---

    /// Create a message with `payload`, which must be a JSON object.
    pub fn emit(&mut self, payload: Value) -> Result<(), AgentError> {
        if !self.capabilities.can_create_messages {
            return Err(AgentError::cannot_create_messages());
        }
        if !payload.is_object() {
            return Err(AgentError::invalid("message payload must be a JSON object"));
        }
        match self.sort_buffer.as_mut() {
            Some(buffer) => {
                buffer.push(payload);
                Ok(())
            }
            None => self.commit_message(payload),
        }
    }

    fn commit_message(&mut self, payload: Value) -> Result<(), AgentError> {
        if let Some(sandbox) = self.sandbox.as_deref_mut() {
            sandbox.push_message(payload);
            return Ok(());
        }

        let expires_at = match self.record.keep_messages_for {
            0 => None,
            secs => Some(Utc::now() + Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        };
        let message = self
            .workflow
            .messages()
            .create(self.record.id, payload, expires_at)?;
        tracing::debug!(agent_id = self.record.id, message_id = message.id, "message created");
        self.record.last_message_at = Some(message.created_at);
        self.emitted.push(message.id);
        Ok(())
    }

    /// Buffer every emission made by `f`, then flush them through the
    /// ordering engine once, whether or not `f` succeeded.
    ///
    /// Does nothing extra unless the agent configured `messages_order` or
    /// `include_sort_info`, or a buffer is already installed.
    pub(crate) fn buffered(&mut self, f: impl FnOnce(&mut Self) -> InvokeResult) -> InvokeResult {
        if self.sort_buffer.is_some() {
            return f(self);
        }
        let spec = match OrderSpec::from_options(&self.record.options) {
            Ok(spec) => spec,
            Err(e) => {
                self.warn(format!("Ignoring invalid messages_order: {e}"));
                None
            }
        };
        let sort_info = self
            .record
            .options
            .get(SORT_INFO_OPTION)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if spec.is_none() && !sort_info {
            return f(self);
        }

        self.sort_buffer = Some(Vec::new());
        let result = f(self);
        let buffered = self.sort_buffer.take().unwrap_or_default();
        let flushed = self.flush_sorted(buffered, &spec.unwrap_or_default(), sort_info);
        result.and(flushed)
    }

    fn flush_sorted(&mut self, buffered: Vec<Value>, spec: &OrderSpec, sort_info: bool) -> InvokeResult {
        let ordered = ordering::sort(buffered, spec, self.workflow.interpolator(), &self.scope());
        for warning in ordered.warnings {
            self.warn(warning);
        }

        let count = ordered.items.len();
        for (i, mut payload) in ordered.items.into_iter().enumerate() {
            if sort_info && let Value::Object(map) = &mut payload {
                map.insert(
                    SORT_INFO_KEY.into(),
                    serde_json::json!({ "position": i + 1, "count": count }),
                );
            }
            self.commit_message(payload)?;
        }
        Ok(())
    }

    pub(crate) fn into_emitted(self) -> Vec<MessageId> {
        self.emitted
    }

    // --- other agents ---

    /// Records of this agent's control targets, in declaration order.
    pub(crate) fn control_targets(&self) -> Result<Vec<AgentRecord>, AgentError> {
        let store = self.workflow.agents();
        let mut targets = Vec::new();
        for id in store.control_targets(self.record.id)? {
            if id == self.record.id {
                targets.push(self.record.clone());
            } else {
                targets.push(store.get(id)?);
            }
        }
        Ok(targets)
    }

    pub(crate) fn capabilities_of(&self, record: &AgentRecord) -> Result<Capabilities, AgentError> {
        self.workflow
            .registry()
            .capabilities(&record.type_name)
            .ok_or_else(|| AgentError::UnknownType(record.type_name.clone()))
    }

    /// Validate `target` and write the one setting `change` names. In a dry
    /// run only the validation happens.
    pub(crate) fn persist_target(&mut self, target: &AgentRecord, change: TargetChange) -> InvokeResult {
        let errors = self.workflow.validate_record(target)?;
        if !errors.is_empty() {
            return Err(AgentError::invalid(errors.to_string()));
        }
        if self.sandbox.is_some() {
            return Ok(());
        }
        let store = self.workflow.agents();
        match change {
            TargetChange::Disabled => store.set_disabled(target.id, target.disabled)?,
            TargetChange::Options => store.set_options(target.id, target.options.clone())?,
        }
        if target.id == self.record.id {
            self.record.disabled = target.disabled;
            self.record.options = target.options.clone();
        }
        Ok(())
    }

    /// Ask the dispatcher to run `check` on another agent. Not awaited.
    pub(crate) fn trigger_check(&mut self, target: AgentId) {
        match self.sandbox.as_deref_mut() {
            Some(sandbox) => {
                sandbox.push_log(LogLevel::Debug, &format!("check of agent {target} not enqueued in dry run"))
            }
            None => self.workflow.jobs().push(Job::Check(target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentBehavior};
    use crate::message::Message;
    use serde_json::json;
    use std::sync::Arc;

    struct Plain;
    impl AgentBehavior for Plain {
        fn type_name(&self) -> &'static str {
            "plain"
        }
    }

    fn harness() -> (Workflow, AgentRecord) {
        let workflow = Workflow::builder("ctx").build().unwrap();
        let record = workflow
            .agents()
            .insert(AgentRecord::new("plain", "plain"))
            .unwrap();
        (workflow, record)
    }

    #[test]
    fn emit_stores_messages_and_tracks_ids() {
        let (workflow, mut record) = harness();
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        ctx.emit(json!({"a": 1})).unwrap();
        ctx.emit(json!({"a": 2})).unwrap();
        let ids = ctx.into_emitted();

        let stored = workflow.messages().get_many(&ids).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].payload, json!({"a": 2}));
        assert!(record.last_message_at.is_some());
    }

    #[test]
    fn emit_requires_capability() {
        let (workflow, mut record) = harness();
        let mut ctx = Ctx::new(
            &mut record,
            Capabilities::new().cannot_create_messages(),
            None,
            &workflow,
        );
        let err = ctx.emit(json!({"a": 1})).unwrap_err();
        assert_eq!(err.to_string(), "This agent cannot create messages");
        assert_eq!(workflow.messages().max_id().unwrap(), 0);
    }

    #[test]
    fn emit_rejects_non_object_payloads() {
        let (workflow, mut record) = harness();
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        assert!(matches!(ctx.emit(json!([1, 2])), Err(AgentError::Invalid(_))));
    }

    #[test]
    fn keep_messages_for_sets_expiry() {
        let (workflow, mut record) = harness();
        record.keep_messages_for = 60;
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        ctx.emit(json!({})).unwrap();
        let ids = ctx.into_emitted();
        let message = &workflow.messages().get_many(&ids).unwrap()[0];
        assert!(message.expires_at.is_some_and(|at| at > message.created_at));
    }

    #[test]
    fn scopes_nest_and_unwind() {
        let (workflow, mut record) = harness();
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        let outer = json!({"x": "outer", "y": "kept"}).as_object().cloned().unwrap();
        let inner = json!({"x": "inner"}).as_object().cloned().unwrap();

        let rendered = ctx.with_scope(outer, |ctx| {
            let nested = ctx.with_scope(inner, |ctx| ctx.interpolate("{{ x }}-{{ y }}").unwrap());
            (nested, ctx.interpolate("{{ x }}").unwrap())
        });
        assert_eq!(rendered, ("inner-kept".to_string(), "outer".to_string()));
        assert!(ctx.scope().is_empty());
    }

    #[test]
    fn logs_land_in_agent_log() {
        let (workflow, mut record) = harness();
        let id = record.id;
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        ctx.log("hello");
        ctx.error("boom");

        let logs = workflow.logs().for_agent(id);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert_eq!(logs[1].message, "boom");
    }

    #[test]
    fn buffered_without_ordering_options_emits_directly() {
        let (workflow, mut record) = harness();
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        ctx.buffered(|ctx| {
            ctx.emit(json!({"n": 2}))?;
            assert_eq!(ctx.workflow.messages().max_id().unwrap(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn buffered_flushes_sorted_even_when_body_fails() {
        let (workflow, mut record) = harness();
        record.options = json!({"messages_order": [["{{ n }}", "number"]], "include_sort_info": true})
            .as_object()
            .cloned()
            .unwrap();
        let mut ctx = Ctx::new(&mut record, Capabilities::new(), None, &workflow);
        let result = ctx.buffered(|ctx| {
            ctx.emit(json!({"n": 3}))?;
            ctx.emit(json!({"n": 1}))?;
            assert_eq!(ctx.workflow.messages().max_id().unwrap(), 0);
            Err(AgentError::other("late failure"))
        });
        assert!(matches!(result, Err(AgentError::Other(_))));

        let ids = ctx.into_emitted();
        let stored: Vec<Message> = workflow.messages().get_many(&ids).unwrap();
        assert_eq!(stored[0].payload["n"], 1);
        assert_eq!(stored[0].payload["_sort_info_"], json!({"position": 1, "count": 2}));
        assert_eq!(stored[1].payload["n"], 3);
        assert_eq!(stored[1].payload["_sort_info_"], json!({"position": 2, "count": 2}));
    }

    #[test]
    fn agent_instance_round_trip() {
        let (workflow, record) = harness();
        let mut agent = Agent::new(record, Arc::new(Plain));
        assert!(agent.check(&workflow).unwrap().is_empty());
    }
}
