//! Ordered emission: a decorator that buffers everything a behavior emits
//! during one invocation and flushes it through the ordering engine.

use std::slice;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::agent::{AgentBehavior, Capabilities};
use crate::ctx::Ctx;
use crate::error::{InvokeResult, ValidationErrors};
use crate::message::Message;
use crate::ordering::{self, OrderSpec, SORT_INFO_OPTION};
use crate::schedule::Schedule;

/// Wraps a behavior whose type declared [`Capabilities::can_order_messages`].
pub struct Sorted {
    inner: Arc<dyn AgentBehavior>,
}

impl Sorted {
    pub fn new(inner: Arc<dyn AgentBehavior>) -> Self {
        Self { inner }
    }
}

impl AgentBehavior for Sorted {
    fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn default_options(&self) -> Map<String, Value> {
        self.inner.default_options()
    }

    fn default_schedule(&self) -> Schedule {
        self.inner.default_schedule()
    }

    fn validate_options(&self, options: &Map<String, Value>, errors: &mut ValidationErrors) {
        self.inner.validate_options(options, errors);
        ordering::validate_options(options, errors);
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        ctx.buffered(|ctx| self.inner.check(ctx))
    }

    /// Each incoming message is its own buffering scope: ordering applies to
    /// what was created in reaction to one input.
    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        let options = ctx.options();
        let ordered = matches!(OrderSpec::from_options(options), Ok(Some(_)))
            || options.get(SORT_INFO_OPTION).and_then(Value::as_bool) == Some(true);
        if !ordered {
            return self.inner.receive(ctx, messages);
        }
        for message in messages {
            ctx.buffered(|ctx| self.inner.receive(ctx, slice::from_ref(message)))?;
        }
        Ok(())
    }
}
