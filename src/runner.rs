use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::agent::{Agent, AgentId, AgentRecord};
use crate::dry_run::DryRunResult;
use crate::error::AgentError;
use crate::jobs::Job;
use crate::logs::{AgentLog, LogLevel};
use crate::message::MessageId;
use crate::schedule::Schedule;
use crate::workflow::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Check,
    Receive,
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationKind::Check => "check",
            InvocationKind::Receive => "receive",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// None of the requested message ids exist any more.
    NoMessages,
}

/// What a live invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { emitted: Vec<MessageId> },
    Skipped(SkipReason),
}

/// Passed to the `on_invocation` hook after each invocation that returned.
pub struct InvocationEvent<'a> {
    pub agent_id: AgentId,
    pub agent: &'a str,
    pub kind: InvocationKind,
    pub outcome: &'a Outcome,
    pub duration: Duration,
}

/// Passed to the `on_error` hook when an invocation fails.
pub struct ErrorEvent<'a> {
    pub agent_id: AgentId,
    pub agent: &'a str,
    pub kind: InvocationKind,
    pub error: &'a AgentError,
}

/// Tally of one [`Runner::work_off`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkReport {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Jobs still queued when the drain stopped.
    pub remaining: usize,
}

type InvocationHook = Box<dyn Fn(&InvocationEvent) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Dispatcher entry points over a [`Workflow`].
///
/// Takes `&self` throughout. Callers must not invoke the same agent from two
/// threads at once; different agents may run concurrently.
pub struct Runner {
    wf: Workflow,
    max_jobs: usize,
    on_invocation: Option<InvocationHook>,
    on_error: Option<ErrorHook>,
}

impl Runner {
    pub fn new(wf: Workflow) -> Self {
        Self {
            wf,
            max_jobs: 10_000,
            on_invocation: None,
            on_error: None,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.wf
    }

    /// Cap on jobs run by one `work_off` call. Stops runaway trigger loops.
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Register a callback that fires after each invocation, skipped or not.
    pub fn on_invocation(mut self, cb: impl Fn(&InvocationEvent) + Send + Sync + 'static) -> Self {
        self.on_invocation = Some(Box::new(cb));
        self
    }

    /// Register a callback that fires when an invocation fails.
    pub fn on_error(mut self, cb: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    /// Set both hooks to emit `tracing` events.
    pub fn with_tracing(self) -> Self {
        self.on_invocation(|e| {
            tracing::info!(
                agent_id = e.agent_id,
                agent = e.agent,
                kind = %e.kind,
                outcome = ?e.outcome,
                duration_ms = e.duration.as_millis() as u64,
                "invocation finished"
            );
        })
        .on_error(|e| {
            tracing::error!(
                agent_id = e.agent_id,
                agent = e.agent,
                kind = %e.kind,
                error = %e.error,
                "invocation failed"
            );
        })
    }

    // ---- Live invocations ----

    /// Run `check` on an agent. Errors propagate to the caller after the
    /// `on_error` hook fires; nothing about the agent is saved in that case.
    pub fn invoke_check(&self, id: AgentId) -> Result<Outcome, AgentError> {
        let mut agent = self.wf.load(id)?;
        if agent.record().disabled {
            return Ok(self.skipped(&agent, InvocationKind::Check, SkipReason::Disabled));
        }

        let start = Instant::now();
        let result = agent.check(&self.wf);
        self.finish(agent, InvocationKind::Check, start, result)
    }

    /// Run `receive` on an agent with the given messages, ascending by id.
    pub fn invoke_receive(&self, id: AgentId, message_ids: &[MessageId]) -> Result<Outcome, AgentError> {
        let mut agent = self.wf.load(id)?;
        if agent.record().disabled {
            return Ok(self.skipped(&agent, InvocationKind::Receive, SkipReason::Disabled));
        }
        let messages = self.wf.messages().get_many(message_ids)?;
        if messages.is_empty() {
            return Ok(self.skipped(&agent, InvocationKind::Receive, SkipReason::NoMessages));
        }

        let start = Instant::now();
        let result = agent.receive(&self.wf, &messages);
        self.finish(agent, InvocationKind::Receive, start, result)
    }

    fn skipped(&self, agent: &Agent, kind: InvocationKind, reason: SkipReason) -> Outcome {
        tracing::debug!(agent_id = agent.id(), %kind, ?reason, "invocation skipped");
        let outcome = Outcome::Skipped(reason);
        self.notify(agent.record(), kind, &outcome, Duration::ZERO);
        outcome
    }

    fn finish(
        &self,
        mut agent: Agent,
        kind: InvocationKind,
        start: Instant,
        result: Result<Vec<MessageId>, AgentError>,
    ) -> Result<Outcome, AgentError> {
        let duration = start.elapsed();
        let emitted = match result {
            Ok(emitted) => emitted,
            Err(error) => {
                if let Some(cb) = &self.on_error {
                    cb(&ErrorEvent {
                        agent_id: agent.id(),
                        agent: &agent.record().name,
                        kind,
                        error: &error,
                    });
                }
                return Err(error);
            }
        };

        let record = agent.record_mut();
        match kind {
            InvocationKind::Check => record.last_check_at = Some(Utc::now()),
            InvocationKind::Receive => record.last_receive_at = Some(Utc::now()),
        }
        self.wf.agents().save_invocation(record)?;

        if record.propagate_immediately && !emitted.is_empty() {
            self.propagate()?;
        }

        let outcome = Outcome::Completed { emitted };
        self.notify(agent.record(), kind, &outcome, duration);
        Ok(outcome)
    }

    fn notify(&self, record: &AgentRecord, kind: InvocationKind, outcome: &Outcome, duration: Duration) {
        if let Some(cb) = &self.on_invocation {
            cb(&InvocationEvent {
                agent_id: record.id,
                agent: &record.name,
                kind,
                outcome,
                duration,
            });
        }
    }

    // ---- Dry runs ----

    pub fn dry_run_check(&self, id: AgentId) -> Result<DryRunResult, AgentError> {
        self.wf.load(id)?.dry_run(&self.wf, None)
    }

    /// Dry-run `receive` with `payload` as the only incoming message.
    pub fn dry_run_receive(&self, id: AgentId, payload: Value) -> Result<DryRunResult, AgentError> {
        self.wf.load(id)?.dry_run(&self.wf, Some(payload))
    }

    // ---- Scheduling and delivery ----

    /// Enqueue a `receive` job for every enabled agent with undelivered
    /// messages on its links, and advance its watermark past them.
    /// Returns the number of jobs enqueued.
    pub fn propagate(&self) -> Result<usize, AgentError> {
        let messages = self.wf.messages();
        let agents = self.wf.agents();
        let mut enqueued = 0;

        for receiver in agents.all()? {
            if receiver.disabled {
                continue;
            }
            let mut pending: Vec<MessageId> = Vec::new();
            for link in agents.links_to(receiver.id)? {
                let after = link.message_id_at_creation.max(receiver.last_checked_message_id);
                pending.extend(messages.query(&[link.source_id], after)?.iter().map(|m| m.id));
            }
            pending.sort_unstable();
            pending.dedup();

            let Some(&newest) = pending.last() else {
                continue;
            };
            // A concurrent pass may have claimed part of this batch already.
            let claimed = agents.advance_watermark(receiver.id, newest)?;
            pending.retain(|id| *id > claimed);
            if pending.is_empty() {
                continue;
            }
            tracing::debug!(agent_id = receiver.id, count = pending.len(), "delivering messages");
            self.wf.jobs().push(Job::Receive(receiver.id, pending));
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Enqueue a `check` job for every enabled, schedulable agent on
    /// `schedule`. Returns the number of jobs enqueued.
    pub fn run_schedule(&self, schedule: Schedule) -> Result<usize, AgentError> {
        if !schedule.is_scheduled() {
            return Ok(0);
        }
        let mut enqueued = 0;
        for record in self.wf.agents().all()? {
            if record.disabled || record.schedule != schedule {
                continue;
            }
            let schedulable = self
                .wf
                .registry()
                .capabilities(&record.type_name)
                .is_some_and(|c| c.can_be_scheduled);
            if schedulable {
                self.wf.jobs().push(Job::Check(record.id));
                enqueued += 1;
            }
        }
        tracing::debug!(%schedule, enqueued, "schedule fired");
        Ok(enqueued)
    }

    /// Run queued jobs in order until the queue is empty or the job cap is
    /// reached. Failures are logged against the agent and do not stop the
    /// drain.
    pub fn work_off(&self) -> WorkReport {
        let mut report = WorkReport::default();
        for _ in 0..self.max_jobs {
            let Some(job) = self.wf.jobs().pop() else {
                break;
            };
            let (id, kind, result) = match job {
                Job::Check(id) => (id, InvocationKind::Check, self.invoke_check(id)),
                Job::Receive(id, ids) => (id, InvocationKind::Receive, self.invoke_receive(id, &ids)),
            };
            match result {
                Ok(Outcome::Completed { .. }) => report.completed += 1,
                Ok(Outcome::Skipped(_)) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.wf.logs().record(AgentLog {
                        agent_id: id,
                        level: LogLevel::Error,
                        message: format!("Exception during {kind}. {e}"),
                        target_id: None,
                        created_at: Utc::now(),
                    });
                }
            }
        }
        report.remaining = self.wf.jobs().len();
        if report.remaining > 0 {
            tracing::warn!(remaining = report.remaining, max_jobs = self.max_jobs, "job cap reached");
        }
        report
    }

    // ---- Maintenance ----

    /// Skip every message currently pending for `id`.
    pub fn drop_pending_messages(&self, id: AgentId) -> Result<AgentRecord, AgentError> {
        let newest = self.wf.messages().max_id()?;
        self.wf.agents().advance_watermark(id, newest)?;
        Ok(self.wf.agents().get(id)?)
    }

    /// Delete expired messages. Returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize, AgentError> {
        let removed = self.wf.messages().remove_expired(Utc::now())?;
        if removed > 0 {
            tracing::info!(removed, "expired messages removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentBehavior, Capabilities};
    use crate::ctx::Ctx;
    use crate::error::InvokeResult;
    use crate::registry::Registry;
    use crate::workflow::AgentSpec;
    use chrono::Duration as ChronoDuration;
    use crate::schedule::Interval;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct Failing;
    impl AgentBehavior for Failing {
        fn type_name(&self) -> &'static str {
            "failing"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().cannot_receive()
        }
        fn default_schedule(&self) -> Schedule {
            Schedule::Every(Interval::FiveMinutes)
        }
        fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
            ctx.memory_mut().insert("touched".into(), json!(true));
            Err(AgentError::transient("boom"))
        }
    }

    fn runner() -> Runner {
        let wf = Workflow::builder("test")
            .registry(Registry::with_builtins().register(Failing))
            .agent(AgentSpec::new("prices", "emitter").options(json!({"payload": {"price": 1}})))
            .agent(AgentSpec::new("fmt", "formatter").options(json!({"instructions": {"p": "{{ price }}"}})))
            .agent(AgentSpec::new("broken", "failing"))
            .link("prices", "fmt")
            .build()
            .unwrap();
        Runner::new(wf)
    }

    fn id(runner: &Runner, name: &str) -> AgentId {
        runner.workflow().agent_by_name(name).unwrap().id
    }

    #[test]
    fn check_saves_memory_and_bookkeeping() {
        let runner = runner();
        let prices = id(&runner, "prices");
        let outcome = runner.invoke_check(prices).unwrap();
        assert!(matches!(outcome, Outcome::Completed { ref emitted } if emitted.len() == 1));

        let record = runner.workflow().agent(prices).unwrap();
        assert_eq!(record.memory.get("runs"), Some(&json!(1)));
        assert!(record.last_check_at.is_some());
        assert!(record.last_message_at.is_some());
    }

    #[test]
    fn failed_check_saves_nothing() {
        let runner = runner();
        let broken = id(&runner, "broken");
        let err = runner.invoke_check(broken).unwrap_err();
        assert_eq!(err.to_string(), "transient: boom");

        let record = runner.workflow().agent(broken).unwrap();
        assert!(record.memory.is_empty());
        assert!(record.last_check_at.is_none());
    }

    #[test]
    fn disabled_agents_are_skipped() {
        let runner = runner();
        let prices = id(&runner, "prices");
        runner.workflow().set_disabled(prices, true).unwrap();
        assert_eq!(
            runner.invoke_check(prices).unwrap(),
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(runner.workflow().messages().max_id().unwrap(), 0);
    }

    #[test]
    fn receive_without_messages_is_skipped() {
        let runner = runner();
        let fmt = id(&runner, "fmt");
        assert_eq!(
            runner.invoke_receive(fmt, &[42]).unwrap(),
            Outcome::Skipped(SkipReason::NoMessages)
        );
    }

    #[test]
    fn propagate_delivers_each_message_once() {
        let runner = runner();
        let prices = id(&runner, "prices");
        let fmt = id(&runner, "fmt");

        runner.invoke_check(prices).unwrap();
        runner.invoke_check(prices).unwrap();
        assert_eq!(runner.propagate().unwrap(), 1);
        assert_eq!(runner.workflow().jobs().snapshot(), vec![Job::Receive(fmt, vec![1, 2])]);
        assert_eq!(runner.workflow().agent(fmt).unwrap().last_checked_message_id, 2);

        assert_eq!(runner.propagate().unwrap(), 0);
        let report = runner.work_off();
        assert_eq!(report.completed, 1);
        assert_eq!(runner.workflow().messages().max_id().unwrap(), 4);
    }

    #[test]
    fn links_never_backfill() {
        let runner = runner();
        let prices = id(&runner, "prices");
        runner.invoke_check(prices).unwrap();

        let wf = runner.workflow();
        let late = wf.create_agent(AgentSpec::new("late", "digest")).unwrap();
        wf.link(prices, late.id).unwrap();
        runner.drop_pending_messages(id(&runner, "fmt")).unwrap();
        assert_eq!(runner.propagate().unwrap(), 0);

        runner.invoke_check(prices).unwrap();
        assert_eq!(runner.propagate().unwrap(), 2);
        assert!(wf.jobs().snapshot().contains(&Job::Receive(late.id, vec![2])));
    }

    #[test]
    fn propagate_immediately_delivers_after_emitting() {
        let wf = Workflow::builder("test")
            .agent(
                AgentSpec::new("prices", "emitter")
                    .options(json!({"payload": {"price": 1}}))
                    .propagate_immediately(true),
            )
            .agent(AgentSpec::new("fmt", "formatter"))
            .link("prices", "fmt")
            .build()
            .unwrap();
        let runner = Runner::new(wf);
        runner.invoke_check(id(&runner, "prices")).unwrap();
        assert_eq!(runner.workflow().jobs().len(), 1);
    }

    #[test]
    fn run_schedule_enqueues_enabled_schedulable_agents() {
        let runner = runner();
        assert_eq!(runner.run_schedule(Schedule::Every(Interval::OneHour)).unwrap(), 1);
        assert_eq!(runner.run_schedule(Schedule::Every(Interval::FiveMinutes)).unwrap(), 1);
        assert_eq!(runner.run_schedule(Schedule::Never).unwrap(), 0);
        assert_eq!(
            runner.workflow().jobs().snapshot(),
            vec![
                Job::Check(id(&runner, "prices")),
                Job::Check(id(&runner, "broken"))
            ]
        );
    }

    #[test]
    fn work_off_logs_failures_and_keeps_going() {
        let runner = runner();
        let broken = id(&runner, "broken");
        runner.workflow().jobs().push(Job::Check(broken));
        runner.workflow().jobs().push(Job::Check(id(&runner, "prices")));

        let report = runner.work_off();
        assert_eq!(report, WorkReport { completed: 1, skipped: 0, failed: 1, remaining: 0 });

        let logs = runner.workflow().logs().for_agent(broken);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "Exception during check. transient: boom");
    }

    #[test]
    fn work_off_respects_the_job_cap() {
        let runner = runner().with_max_jobs(1);
        let prices = id(&runner, "prices");
        runner.workflow().jobs().push(Job::Check(prices));
        runner.workflow().jobs().push(Job::Check(prices));
        assert_eq!(runner.work_off().remaining, 1);
    }

    #[test]
    fn cleanup_removes_only_expired_messages() {
        let runner = runner();
        let prices = id(&runner, "prices");
        let messages = runner.workflow().messages();
        messages
            .create(prices, json!({}), Some(Utc::now() - ChronoDuration::seconds(5)))
            .unwrap();
        messages
            .create(prices, json!({}), Some(Utc::now() + ChronoDuration::hours(1)))
            .unwrap();
        assert_eq!(runner.cleanup_expired().unwrap(), 1);
        assert_eq!(runner.cleanup_expired().unwrap(), 0);
    }

    #[test]
    fn dry_runs_go_through_the_runner() {
        let runner = runner();
        let fmt = id(&runner, "fmt");
        let result = runner.dry_run_receive(fmt, json!({"price": 9})).unwrap();
        assert_eq!(result.messages, vec![json!({"p": "9"})]);
        assert_eq!(runner.workflow().messages().max_id().unwrap(), 0);

        let err = runner.dry_run_check(id(&runner, "broken")).unwrap_err();
        assert_eq!(err.to_string(), "failing does not support dry-run");
    }

    // --- hook tests ---

    #[test]
    fn on_invocation_fires_on_success_and_skip() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let runner = runner().on_invocation(move |e| {
            seen_clone.lock().unwrap().push((e.agent.to_string(), e.kind));
        });

        runner.invoke_check(id(&runner, "prices")).unwrap();
        runner.invoke_receive(id(&runner, "fmt"), &[]).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("prices".to_string(), InvocationKind::Check),
                ("fmt".to_string(), InvocationKind::Receive)
            ]
        );
    }

    #[test]
    fn on_error_fires_on_failure() {
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = Arc::clone(&count);
        let runner = runner().on_error(move |e| {
            assert_eq!(e.agent, "broken");
            *count_clone.lock().unwrap() += 1;
        });

        let _ = runner.invoke_check(id(&runner, "broken"));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
