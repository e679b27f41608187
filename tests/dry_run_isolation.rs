//! Dry runs leave no trace in the stores or the durable log.

use agent_mesh::{
    AgentBehavior, AgentError, AgentSpec, Capabilities, Ctx, InvokeResult, Message, Registry,
    Runner, Workflow,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

/// Increments `a` in memory and emits the new value.
struct Counter;

impl AgentBehavior for Counter {
    fn type_name(&self) -> &'static str {
        "counter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().dry_runnable()
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        let a = ctx.memory().get("a").and_then(Value::as_i64).unwrap_or(0) + 1;
        ctx.memory_mut().insert("a".into(), json!(a));
        ctx.log(format!("a is now {a}"));
        ctx.emit(json!({"a": a}))
    }

    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        for message in messages {
            if message.payload.get("boom").is_some() {
                return Err(AgentError::other("exploded on purpose"));
            }
        }
        self.check(ctx)
    }
}

fn runner() -> Runner {
    let wf = Workflow::builder("dry")
        .registry(Registry::with_builtins().register(Counter))
        .agent(AgentSpec::new("counter", "counter"))
        .build()
        .unwrap();
    let mut record = wf.agent_by_name("counter").unwrap();
    record.memory = json!({"a": 1}).as_object().cloned().unwrap();
    wf.agents().save(&record).unwrap();
    Runner::new(wf)
}

#[test]
fn dry_run_check_never_persists() {
    let runner = runner();
    let wf = runner.workflow();
    let id = wf.agent_by_name("counter").unwrap().id;

    let result = runner.dry_run_check(id).unwrap();

    assert_eq!(Value::Object(result.memory), json!({"a": 2}));
    assert_eq!(result.messages, vec![json!({"a": 2})]);
    assert!(result.log.contains("INFO -- : a is now 2"));

    assert_eq!(Value::Object(wf.agent(id).unwrap().memory), json!({"a": 1}));
    assert_eq!(wf.messages().max_id().unwrap(), 0);
    assert!(wf.logs().for_agent(id).is_empty());
    assert!(wf.agent(id).unwrap().last_check_at.is_none());
}

#[test]
fn dry_run_receive_reports_failures_in_the_log() {
    let runner = runner();
    let id = runner.workflow().agent_by_name("counter").unwrap().id;

    let result = runner.dry_run_receive(id, json!({"boom": true})).unwrap();
    assert!(result.failed);
    assert!(result.messages.is_empty());
    assert!(
        result
            .log
            .contains("ERROR -- : Exception during dry-run. exploded on purpose")
    );
}

#[test]
fn live_run_after_dry_run_persists_normally() {
    let runner = runner();
    let id = runner.workflow().agent_by_name("counter").unwrap().id;

    runner.dry_run_check(id).unwrap();
    runner.invoke_check(id).unwrap();

    let record = runner.workflow().agent(id).unwrap();
    assert_eq!(record.memory.get("a"), Some(&json!(2)));
    assert_eq!(runner.workflow().messages().max_id().unwrap(), 1);
}

#[test]
fn input_is_rejected_for_agents_that_cannot_receive() {
    let wf = Workflow::builder("dry")
        .agent(AgentSpec::new("feed", "emitter"))
        .build()
        .unwrap();
    let id = wf.agent_by_name("feed").unwrap().id;
    let runner = Runner::new(wf);

    let err = runner.dry_run_receive(id, json!({})).unwrap_err();
    assert_eq!(err.to_string(), "This agent cannot receive messages");
    assert!(runner.dry_run_check(id).is_ok());
}
