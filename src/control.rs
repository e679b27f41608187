//! Lifecycle control of one agent by another.
//!
//! A controller's `action` option (optionally a template) is resolved once
//! per control target, with the target exposed to the template as `target`.
//! Failures are logged against the controller and never stop the remaining
//! targets from being processed.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value, json};

use crate::agent::{AgentRecord, Capabilities};
use crate::ctx::{Ctx, TargetChange};
use crate::error::{AgentError, ValidationErrors};
use crate::logs::LogLevel;
use crate::template::looks_like_template;

pub const ACTION_OPTION: &str = "action";
pub const CONFIGURE_OPTIONS: &str = "configure_options";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Run,
    Enable,
    Disable,
    Configure,
    /// The empty string: do nothing.
    Noop,
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "run" => Ok(ControlAction::Run),
            "enable" => Ok(ControlAction::Enable),
            "disable" => Ok(ControlAction::Disable),
            "configure" => Ok(ControlAction::Configure),
            "" => Ok(ControlAction::Noop),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlAction::Run => "run",
            ControlAction::Enable => "enable",
            ControlAction::Disable => "disable",
            ControlAction::Configure => "configure",
            ControlAction::Noop => "",
        })
    }
}

/// Configuration-time checks for a controller. `targets` are its current
/// control targets with their capabilities.
pub fn validate_options(
    options: &Map<String, Value>,
    targets: &[(&AgentRecord, Capabilities)],
    errors: &mut ValidationErrors,
) {
    let action = match options.get(ACTION_OPTION) {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            errors.add(ACTION_OPTION, "must be a string");
            return;
        }
        None => {
            errors.add(ACTION_OPTION, "must be specified");
            return;
        }
    };

    match action.parse::<ControlAction>() {
        Ok(ControlAction::Run) => {
            for (target, caps) in targets {
                if !caps.can_be_scheduled {
                    errors.add(ACTION_OPTION, format!("{} cannot be scheduled", target.name));
                }
            }
        }
        Ok(ControlAction::Configure) => {
            let supplied = options
                .get(CONFIGURE_OPTIONS)
                .and_then(Value::as_object)
                .is_some_and(|m| !m.is_empty());
            if !supplied {
                errors.add(
                    CONFIGURE_OPTIONS,
                    "must be a non-empty map when using the 'configure' action",
                );
            }
        }
        Ok(_) => {}
        Err(_) if looks_like_template(action) => {}
        Err(other) => errors.add(ACTION_OPTION, format!("'{other}' is not a supported action")),
    }
}

/// Recursively merge `patch` into `base`. Maps merge, anything else replaces.
pub fn deep_merge(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn target_vars(target: &AgentRecord) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert(
        "target".into(),
        json!({
            "id": target.id,
            "name": target.name,
            "type": target.type_name,
            "schedule": target.schedule.to_string(),
            "disabled": target.disabled,
            "options": target.options,
        }),
    );
    vars
}

/// Why one target could not be handled.
struct Failure {
    action: String,
    error: AgentError,
}

/// Apply the controller's action to each of its control targets in
/// declaration order. Never fails: per-target problems are logged.
pub fn control(ctx: &mut Ctx<'_>) {
    let targets = match ctx.control_targets() {
        Ok(targets) => targets,
        Err(e) => {
            ctx.error(format!("Failed to load control targets: {e}"));
            return;
        }
    };

    for target in targets {
        ctx.with_scope(target_vars(&target), |ctx| {
            if let Err(failure) = apply(ctx, target.clone()) {
                ctx.log_at(
                    LogLevel::Error,
                    Some(target.id),
                    format!(
                        "Failed to {} '{}': {}",
                        failure.action, target.name, failure.error
                    ),
                );
            }
        });
    }
}

fn apply(ctx: &mut Ctx<'_>, mut target: AgentRecord) -> Result<(), Failure> {
    let raw = match ctx.option(ACTION_OPTION) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    let resolved = ctx.interpolate(&raw).map_err(|error| Failure {
        action: raw.clone(),
        error,
    })?;
    let fail = |error: AgentError| Failure {
        action: resolved.clone(),
        error,
    };

    let action = match resolved.parse::<ControlAction>() {
        Ok(action) => action,
        Err(unsupported) => {
            ctx.log_at(
                LogLevel::Error,
                Some(target.id),
                format!("Unsupported action '{unsupported}' ignored for '{}'", target.name),
            );
            return Ok(());
        }
    };

    match action {
        ControlAction::Noop => {}
        ControlAction::Run => {
            let caps = ctx.capabilities_of(&target).map_err(fail)?;
            if target.disabled {
                ctx.log_at(
                    LogLevel::Info,
                    Some(target.id),
                    format!("Agent run ignored for disabled Agent '{}'", target.name),
                );
            } else if !caps.can_be_scheduled {
                ctx.log_at(
                    LogLevel::Error,
                    Some(target.id),
                    format!("'{}' cannot run without an incoming message", target.name),
                );
            } else {
                ctx.trigger_check(target.id);
                ctx.log_at(
                    LogLevel::Info,
                    Some(target.id),
                    format!("Agent '{}' is triggered", target.name),
                );
            }
        }
        ControlAction::Enable | ControlAction::Disable => {
            let disable = action == ControlAction::Disable;
            let state = if disable { "disabled" } else { "enabled" };
            if target.disabled == disable {
                ctx.log_at(
                    LogLevel::Info,
                    Some(target.id),
                    format!("Agent '{}' is already {state}", target.name),
                );
            } else {
                target.disabled = disable;
                ctx.persist_target(&target, TargetChange::Disabled).map_err(fail)?;
                ctx.log_at(
                    LogLevel::Info,
                    Some(target.id),
                    format!("Agent '{}' is {state}", target.name),
                );
            }
        }
        ControlAction::Configure => {
            let patch = match ctx.interpolated_option(CONFIGURE_OPTIONS).map_err(fail)? {
                Some(Value::Object(patch)) if !patch.is_empty() => patch,
                _ => {
                    return Err(fail(AgentError::invalid(
                        "configure_options must be a non-empty map",
                    )));
                }
            };
            deep_merge(&mut target.options, &patch);
            ctx.persist_target(&target, TargetChange::Options).map_err(fail)?;
            ctx.log_at(
                LogLevel::Info,
                Some(target.id),
                format!(
                    "Agent '{}' is configured with {}",
                    target.name,
                    Value::Object(patch)
                ),
            );
        }
    }
    Ok(())
}
