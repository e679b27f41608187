//! Different agents invoked at the same time through one runner.

use std::sync::{Arc, Barrier};
use std::thread;

use agent_mesh::{
    AgentBehavior, AgentId, AgentSpec, Capabilities, Ctx, InvokeResult, Job, Message, Registry,
    Runner, Workflow,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

/// Holds every invocation open until the test thread has met it twice: once
/// when the invocation has started, once when the test is done interfering.
struct Gate {
    barrier: Arc<Barrier>,
}

impl Gate {
    fn hold(&self) {
        self.barrier.wait();
        self.barrier.wait();
    }
}

impl AgentBehavior for Gate {
    fn type_name(&self) -> &'static str {
        "gate"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        self.hold();
        ctx.memory_mut().insert("checked".into(), json!(true));
        Ok(())
    }

    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        self.hold();
        let seen = ctx.memory().get("received").and_then(Value::as_u64).unwrap_or(0);
        ctx.memory_mut().insert("received".into(), json!(seen + messages.len() as u64));
        Ok(())
    }
}

fn runner(barrier: &Arc<Barrier>, boss_options: Value) -> Runner {
    let registry = Registry::with_builtins().register(Gate {
        barrier: Arc::clone(barrier),
    });
    let wf = Workflow::builder("concurrent")
        .registry(registry)
        .agent(AgentSpec::new("feed", "emitter").options(json!({"payload": {"price": 1}})))
        .agent(AgentSpec::new("slow", "gate"))
        .agent(AgentSpec::new("boss", "commander").options(boss_options))
        .link("feed", "slow")
        .control("boss", "slow")
        .build()
        .unwrap();
    Runner::new(wf)
}

fn id(runner: &Runner, name: &str) -> AgentId {
    runner.workflow().agent_by_name(name).unwrap().id
}

// --- delivery ---

#[test]
fn delivery_during_a_receive_is_not_repeated() {
    let barrier = Arc::new(Barrier::new(2));
    let runner = runner(&barrier, json!({"action": ""}));
    let (feed, slow) = (id(&runner, "feed"), id(&runner, "slow"));

    runner.invoke_check(feed).unwrap();
    runner.propagate().unwrap();
    let Some(Job::Receive(_, first)) = runner.workflow().jobs().pop() else {
        panic!("no receive job queued");
    };
    assert_eq!(first, vec![1]);

    thread::scope(|s| {
        let receiving = s.spawn(|| runner.invoke_receive(slow, &first));
        barrier.wait();
        runner.invoke_check(feed).unwrap();
        assert_eq!(runner.propagate().unwrap(), 1);
        barrier.wait();
        receiving.join().unwrap().unwrap();
    });

    assert_eq!(
        runner.workflow().jobs().snapshot(),
        vec![Job::Receive(slow, vec![2])]
    );
    let record = runner.workflow().agent(slow).unwrap();
    assert_eq!(record.last_checked_message_id, 2);
    assert_eq!(record.memory.get("received"), Some(&json!(1)));
    assert_eq!(runner.propagate().unwrap(), 0);
}

// --- control ---

#[test]
fn disable_during_the_targets_own_check_sticks() {
    let barrier = Arc::new(Barrier::new(2));
    let runner = runner(&barrier, json!({"action": "disable"}));
    let (slow, boss) = (id(&runner, "slow"), id(&runner, "boss"));

    thread::scope(|s| {
        let checking = s.spawn(|| runner.invoke_check(slow));
        barrier.wait();
        runner.invoke_check(boss).unwrap();
        barrier.wait();
        checking.join().unwrap().unwrap();
    });

    let record = runner.workflow().agent(slow).unwrap();
    assert!(record.disabled);
    assert_eq!(record.memory.get("checked"), Some(&json!(true)));
    assert!(record.last_check_at.is_some());
    let logs: Vec<String> = runner
        .workflow()
        .logs()
        .for_agent(boss)
        .into_iter()
        .map(|l| l.message)
        .collect();
    assert_eq!(logs, vec!["Agent 'slow' is disabled".to_string()]);
}

#[test]
fn configure_during_the_targets_own_check_sticks() {
    let barrier = Arc::new(Barrier::new(2));
    let runner = runner(
        &barrier,
        json!({"action": "configure", "configure_options": {"label": "night"}}),
    );
    let (slow, boss) = (id(&runner, "slow"), id(&runner, "boss"));

    thread::scope(|s| {
        let checking = s.spawn(|| runner.invoke_check(slow));
        barrier.wait();
        runner.invoke_check(boss).unwrap();
        barrier.wait();
        checking.join().unwrap().unwrap();
    });

    let record = runner.workflow().agent(slow).unwrap();
    assert_eq!(record.options.get("label"), Some(&json!("night")));
    assert!(!record.disabled);
    assert_eq!(record.memory.get("checked"), Some(&json!(true)));
}
