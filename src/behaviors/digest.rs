//! `digest`: collects incoming payloads and re-emits them as one batch on
//! its next `check`, so the whole batch is ordered together.

use serde_json::Value;

use crate::agent::{AgentBehavior, Capabilities};
use crate::ctx::Ctx;
use crate::error::InvokeResult;
use crate::message::Message;
use crate::schedule::{Hour, Schedule};

const QUEUE: &str = "queue";

const FLUSH_HOUR: Hour = match Hour::new(6) {
    Some(hour) => hour,
    None => Hour::MIDNIGHT,
};

pub struct Digest;

impl AgentBehavior for Digest {
    fn type_name(&self) -> &'static str {
        "digest"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().dry_runnable().sortable()
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::Daily(FLUSH_HOUR)
    }

    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        let memory = ctx.memory_mut();
        let queue = memory
            .entry(QUEUE)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !queue.is_array() {
            *queue = Value::Array(Vec::new());
        }
        if let Value::Array(queue) = queue {
            queue.extend(messages.iter().map(|m| m.payload.clone()));
        }
        Ok(())
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        let queued = match ctx.memory_mut().remove(QUEUE) {
            Some(Value::Array(queued)) => queued,
            _ => return Ok(()),
        };
        ctx.log(format!("Emitting {} queued messages", queued.len()));
        for payload in queued {
            ctx.emit(payload)?;
        }
        Ok(())
    }
}
