//! `emitter`: a scheduled source that emits its configured payloads.

use serde_json::{Map, Value, json};

use crate::agent::{AgentBehavior, Capabilities};
use crate::ctx::Ctx;
use crate::error::{InvokeResult, ValidationErrors};
use crate::schedule::{Interval, Schedule};

/// Emits `payload`, or every entry of `payloads`, on each `check`.
///
/// String values are interpolated with `run` (how many checks this agent has
/// completed, counting the current one) in scope.
pub struct Emitter;

impl AgentBehavior for Emitter {
    fn type_name(&self) -> &'static str {
        "emitter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().cannot_receive().dry_runnable().sortable()
    }

    fn default_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("payload".into(), json!({"message": "run {{ run }}"}));
        options
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::Every(Interval::OneHour)
    }

    fn validate_options(&self, options: &Map<String, Value>, errors: &mut ValidationErrors) {
        match (options.get("payload"), options.get("payloads")) {
            (Some(Value::Object(_)), None) => {}
            (None, Some(Value::Array(items))) => {
                if !items.iter().all(Value::is_object) {
                    errors.add("payloads", "must contain only objects");
                }
            }
            (Some(_), Some(_)) => errors.add("payload", "use either payload or payloads, not both"),
            (Some(_), None) => errors.add("payload", "must be an object"),
            (None, Some(_)) => errors.add("payloads", "must be an array"),
            (None, None) => errors.add("payload", "must be specified"),
        }
    }

    fn check(&self, ctx: &mut Ctx<'_>) -> InvokeResult {
        let run = ctx.memory().get("runs").and_then(Value::as_u64).unwrap_or(0) + 1;
        ctx.memory_mut().insert("runs".into(), json!(run));

        let payloads = match (ctx.option("payload"), ctx.option("payloads")) {
            (Some(payload), _) => vec![payload.clone()],
            (None, Some(Value::Array(items))) => items.clone(),
            _ => Vec::new(),
        };

        let mut vars = Map::new();
        vars.insert("run".into(), json!(run));
        ctx.with_scope(vars, |ctx| {
            for payload in &payloads {
                let payload = ctx.interpolate_value(payload)?;
                ctx.emit(payload)?;
            }
            Ok(())
        })
    }
}
