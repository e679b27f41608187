//! `commander`: applies its `action` to every control target, on schedule
//! or once per incoming message (with that message's payload in scope).

use serde_json::{Map, Value, json};

use crate::agent::{AgentBehavior, Capabilities};
use crate::control::{self, ACTION_OPTION};
use crate::ctx::Ctx;
use crate::error::InvokeResult;
use crate::message::Message;

pub struct Commander;

impl AgentBehavior for Commander {
    fn type_name(&self) -> &'static str {
        "commander"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .cannot_create_messages()
            .controls_others()
            .dry_runnable()
    }

    fn default_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert(ACTION_OPTION.into(), json!("run"));
        options
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        control::control(ctx);
        Ok(())
    }

    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        for message in messages {
            let vars = message.payload.as_object().cloned().unwrap_or_default();
            ctx.with_scope(vars, |ctx| control::control(ctx));
        }
        Ok(())
    }
}
