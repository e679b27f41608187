use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentId;

/// Monotonic creation order of a message. Zero means "not stored".
pub type MessageId = u64;

/// An immutable unit of payload produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub agent_id: AgentId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A message that was never stored, used to dry-run `receive`.
    pub fn transient(payload: Value) -> Self {
        Self {
            id: 0,
            agent_id: 0,
            payload,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Anything the ordering engine can pull a payload out of.
pub trait HasPayload {
    fn payload(&self) -> &Value;
}

impl HasPayload for Message {
    fn payload(&self) -> &Value {
        &self.payload
    }
}

impl HasPayload for Value {
    fn payload(&self) -> &Value {
        self
    }
}
