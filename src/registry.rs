//! Type-name lookup table for agent behaviors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::{AgentBehavior, Capabilities};
use crate::behaviors::{Commander, Digest, Emitter, Formatter};
use crate::sortable::Sorted;

/// Behaviors keyed by their type name, resolved once at registration.
#[derive(Clone, Default)]
pub struct Registry {
    behaviors: HashMap<String, Arc<dyn AgentBehavior>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in agent types.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(Emitter)
            .register(Formatter)
            .register(Digest)
            .register(Commander)
    }

    /// Register `behavior` under its type name. Types that declare
    /// [`Capabilities::can_order_messages`] are wrapped for ordered emission.
    /// A later registration replaces an earlier one with the same name.
    pub fn register<B: AgentBehavior>(mut self, behavior: B) -> Self {
        let name = behavior.type_name();
        let behavior: Arc<dyn AgentBehavior> = if behavior.capabilities().can_order_messages {
            Arc::new(Sorted::new(Arc::new(behavior)))
        } else {
            Arc::new(behavior)
        };
        if self.behaviors.insert(name.to_string(), behavior).is_some() {
            tracing::warn!(agent_type = name, "agent type registered twice, keeping the latest");
        }
        self
    }

    pub fn resolve(&self, type_name: &str) -> Option<Arc<dyn AgentBehavior>> {
        self.behaviors.get(type_name).cloned()
    }

    pub fn capabilities(&self, type_name: &str) -> Option<Capabilities> {
        self.behaviors.get(type_name).map(|b| b.capabilities())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.behaviors.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.behaviors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
