//! Per-agent log entries, visible to whoever inspects an agent.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Entries kept per agent unless configured otherwise.
pub const DEFAULT_LOG_LENGTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLog {
    pub agent_id: AgentId,
    pub level: LogLevel,
    pub message: String,
    /// The other agent this entry is about, e.g. a control target.
    pub target_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
}

/// Bounded log ring per agent. Every entry is mirrored to `tracing`.
pub struct AgentLogs {
    length: usize,
    entries: Mutex<HashMap<AgentId, VecDeque<AgentLog>>>,
}

impl AgentLogs {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, entry: AgentLog) {
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(agent_id = entry.agent_id, target_id = ?entry.target_id, "{}", entry.message)
            }
            LogLevel::Info => {
                tracing::info!(agent_id = entry.agent_id, target_id = ?entry.target_id, "{}", entry.message)
            }
            LogLevel::Warn => {
                tracing::warn!(agent_id = entry.agent_id, target_id = ?entry.target_id, "{}", entry.message)
            }
            LogLevel::Error => {
                tracing::error!(agent_id = entry.agent_id, target_id = ?entry.target_id, "{}", entry.message)
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ring = entries.entry(entry.agent_id).or_default();
        ring.push_back(entry);
        while ring.len() > self.length {
            ring.pop_front();
        }
    }

    /// Entries for one agent, oldest first.
    pub fn for_agent(&self, agent_id: AgentId) -> Vec<AgentLog> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&agent_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, agent_id: AgentId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&agent_id);
    }
}

impl Default for AgentLogs {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(agent_id: AgentId, message: &str) -> AgentLog {
        AgentLog {
            agent_id,
            level: LogLevel::Info,
            message: message.into(),
            target_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_entries_per_agent() {
        let logs = AgentLogs::default();
        logs.record(entry(1, "one"));
        logs.record(entry(2, "two"));
        logs.record(entry(1, "three"));

        let messages: Vec<_> = logs.for_agent(1).into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["one", "three"]);
        assert_eq!(logs.for_agent(2).len(), 1);
        assert!(logs.for_agent(3).is_empty());
    }

    #[test]
    fn drops_oldest_beyond_length() {
        let logs = AgentLogs::new(2);
        for m in ["a", "b", "c"] {
            logs.record(entry(1, m));
        }
        let messages: Vec<_> = logs.for_agent(1).into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn clear_forgets_one_agent() {
        let logs = AgentLogs::default();
        logs.record(entry(1, "x"));
        logs.record(entry(2, "y"));
        logs.clear(1);
        assert!(logs.for_agent(1).is_empty());
        assert_eq!(logs.for_agent(2).len(), 1);
    }

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
        assert!(LogLevel::Warn > LogLevel::Info);
    }
}
