//! `formatter`: reacts to each incoming message by emitting its
//! `instructions`, interpolated against that message's payload.

use serde_json::{Map, Value, json};

use crate::agent::{AgentBehavior, Capabilities};
use crate::ctx::Ctx;
use crate::error::{InvokeResult, ValidationErrors};
use crate::message::Message;

/// `mode = "clean"` emits only the rendered instructions. `"merge"` emits
/// the incoming payload with the rendered instructions laid over it.
pub struct Formatter;

fn merge_mode(options: &Map<String, Value>) -> bool {
    options.get("mode").and_then(Value::as_str) == Some("merge")
}

impl AgentBehavior for Formatter {
    fn type_name(&self) -> &'static str {
        "formatter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().cannot_be_scheduled().dry_runnable().sortable()
    }

    fn default_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("instructions".into(), json!({"message": "{{ message }}"}));
        options.insert("mode".into(), json!("clean"));
        options
    }

    fn validate_options(&self, options: &Map<String, Value>, errors: &mut ValidationErrors) {
        if !options.get("instructions").is_some_and(Value::is_object) {
            errors.add("instructions", "must be an object");
        }
        match options.get("mode").and_then(Value::as_str) {
            None | Some("clean") | Some("merge") => {}
            Some(_) => errors.add("mode", "must be 'clean' or 'merge'"),
        }
    }

    fn receive(&self, ctx: &mut Ctx<'_>, messages: &[Message]) -> InvokeResult {
        let instructions = ctx.option("instructions").cloned().unwrap_or_else(|| json!({}));
        let merge = merge_mode(ctx.options());

        for message in messages {
            let vars = message.payload.as_object().cloned().unwrap_or_default();
            let rendered = ctx.with_scope(vars, |ctx| ctx.interpolate_value(&instructions))?;
            let payload = match (merge, &message.payload, rendered) {
                (true, Value::Object(incoming), Value::Object(overlay)) => {
                    let mut merged = incoming.clone();
                    merged.extend(overlay);
                    Value::Object(merged)
                }
                (_, _, rendered) => rendered,
            };
            ctx.emit(payload)?;
        }
        Ok(())
    }
}
