//! String interpolation used for sort keys, control actions and option values.
//!
//! The core only depends on the [`Interpolator`] trait. [`JinjaInterpolator`]
//! is the stock implementation, rendering `{{ var }}` style templates with
//! MiniJinja.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

/// Evaluates a template against a context map. Must be pure, and must render
/// missing keys as empty strings rather than failing.
pub trait Interpolator: Send + Sync {
    fn evaluate(&self, template: &str, context: &Map<String, Value>) -> Result<String, TemplateError>;
}

/// Whether `s` contains a template delimiter.
pub fn looks_like_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Evaluate every string inside `value`, keeping its shape.
pub fn interpolate_value(
    interpolator: &dyn Interpolator,
    value: &Value,
    context: &Map<String, Value>,
) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolator.evaluate(s, context)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate_value(interpolator, v, context))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(interpolator, v, context)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

pub struct JinjaInterpolator {
    env: Environment<'static>,
}

impl JinjaInterpolator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env }
    }
}

impl Default for JinjaInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator for JinjaInterpolator {
    fn evaluate(&self, template: &str, context: &Map<String, Value>) -> Result<String, TemplateError> {
        if !looks_like_template(template) {
            return Ok(template.to_string());
        }
        self.env
            .render_str(template, context)
            .map_err(|e| TemplateError(format!("failed to render '{template}': {e}")))
    }
}
