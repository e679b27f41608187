//! Dry runs: invoke an agent with every durable side effect redirected into
//! an in-memory result.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::Once;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::logs::LogLevel;
use crate::message::Message;
use crate::workflow::Workflow;

/// What a dry run would have done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunResult {
    /// Payloads that would have become messages, in emission order.
    pub messages: Vec<Value>,
    /// The agent's memory after the run. Never persisted.
    pub memory: Map<String, Value>,
    pub log: String,
    /// The sandboxed call returned an error or panicked.
    pub failed: bool,
}

/// Sink for everything a sandboxed invocation produces.
#[derive(Debug)]
pub struct DryRunCapture {
    started: Instant,
    messages: Vec<Value>,
    log: String,
    failed: bool,
}

impl DryRunCapture {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            messages: Vec::new(),
            log: String::new(),
            failed: false,
        }
    }

    pub(crate) fn push_message(&mut self, payload: Value) {
        self.messages.push(payload);
    }

    pub(crate) fn push_log(&mut self, level: LogLevel, message: &str) {
        let elapsed = format_elapsed(self.started.elapsed());
        let _ = writeln!(self.log, "[{elapsed}] {level} -- : {message}");
    }

    fn fail(&mut self, message: &str) {
        self.failed = true;
        self.push_log(LogLevel::Error, message);
    }

    fn finish(self, memory: Map<String, Value>) -> DryRunResult {
        DryRunResult {
            messages: self.messages,
            memory,
            log: self.log,
            failed: self.failed,
        }
    }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

thread_local! {
    /// `Some` while a sandboxed call runs on this thread. The panic hook
    /// stores the panic site and its backtrace here.
    static PANIC_TRACE: RefCell<Option<Option<String>>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current one that captures panics raised
/// inside a sandbox instead of printing them. Other panics pass through.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let captured = PANIC_TRACE.with(|slot| match slot.borrow_mut().as_mut() {
                Some(trace) => {
                    let site = info.location().map(|l| format!(" at {l}")).unwrap_or_default();
                    *trace = Some(format!("Panicked{site}. Backtrace:\n{}", Backtrace::force_capture()));
                    true
                }
                None => false,
            });
            if !captured {
                previous(info);
            }
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

impl Agent {
    /// Dry-run `check`, or `receive` with `input` as the only message.
    ///
    /// Fails fast when the agent type does not support dry runs, or when an
    /// input is given to an agent that cannot receive. Past that point this
    /// always returns a result: errors and panics inside the run are written
    /// to the result's log.
    pub fn dry_run(&mut self, workflow: &Workflow, input: Option<Value>) -> Result<DryRunResult, AgentError> {
        if !self.capabilities.can_dry_run {
            return Err(AgentError::Capability(format!(
                "{} does not support dry-run",
                self.record.type_name
            )));
        }
        if input.is_some() && !self.capabilities.can_receive {
            return Err(AgentError::cannot_receive_messages());
        }

        let pristine = self.record.clone();
        self.sandbox = Some(DryRunCapture::start());

        let input = input.map(Message::transient);
        install_panic_hook();
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(None));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &input {
            Some(message) => self.receive(workflow, slice::from_ref(message)),
            None => self.check(workflow),
        }));
        let panic_trace = PANIC_TRACE.with(|slot| slot.borrow_mut().take()).flatten();

        let mut capture = self.sandbox.take().unwrap_or_else(DryRunCapture::start);
        match outcome {
            Ok(Ok(_)) => {}
            // Errors carry no trace of their own; record where the sandbox saw them.
            Ok(Err(e)) => capture.fail(&format!(
                "Exception during dry-run. {e}\nBacktrace at the sandbox boundary:\n{}",
                Backtrace::force_capture()
            )),
            Err(payload) => {
                let trace = panic_trace.unwrap_or_else(|| {
                    format!("Backtrace at the sandbox boundary:\n{}", Backtrace::force_capture())
                });
                capture.fail(&format!(
                    "Exception during dry-run. {}\n{trace}",
                    panic_message(payload.as_ref())
                ));
            }
        }

        let touched = std::mem::replace(&mut self.record, pristine);
        Ok(capture.finish(touched.memory))
    }
}
