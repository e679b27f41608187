//! Contracts for the message store and the agent store, with in-memory
//! implementations.
//!
//! Both stores are shared by every agent in a workflow, so implementations
//! must tolerate concurrent callers working on unrelated agent ids.
//!
//! An agent record has several writers: the invocation that owns its memory,
//! the propagation pass that owns its watermark, and controllers or users
//! that change `disabled` and `options`. Each writes only its own fields
//! through the field-scoped methods on [`AgentStore`]; `save` overwrites the
//! whole record and is meant for setup and administration.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{AgentId, AgentRecord};
use crate::error::StoreError;
use crate::message::{Message, MessageId};

/// Directed edge: `receiver` consumes messages created by `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source_id: AgentId,
    pub receiver_id: AgentId,
    /// Store maximum at link creation. Older messages are never delivered.
    pub message_id_at_creation: MessageId,
}

/// Directed edge: `controller` may apply lifecycle actions to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLink {
    pub controller_id: AgentId,
    pub target_id: AgentId,
}

/// Persists messages with strictly increasing ids.
pub trait MessageStore: Send + Sync {
    fn create(
        &self,
        agent_id: AgentId,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Message, StoreError>;

    /// Messages of any of `sources` with an id greater than `after`,
    /// ascending by id.
    fn query(&self, sources: &[AgentId], after: MessageId) -> Result<Vec<Message>, StoreError>;

    /// The listed messages that still exist, ascending by id.
    fn get_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError>;

    /// Highest id ever assigned, or zero.
    fn max_id(&self) -> Result<MessageId, StoreError>;

    fn remove(&self, id: MessageId) -> Result<bool, StoreError>;

    /// Delete every message expired at `now`. Returns how many went.
    fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Persists agent records and the two edge relations between them.
pub trait AgentStore: Send + Sync {
    /// Store a new record, assigning its id.
    fn insert(&self, record: AgentRecord) -> Result<AgentRecord, StoreError>;

    fn get(&self, id: AgentId) -> Result<AgentRecord, StoreError>;

    fn find_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError>;

    /// Overwrite an existing record.
    fn save(&self, record: &AgentRecord) -> Result<(), StoreError>;

    /// Write back what an invocation owns: `memory` and the `last_*_at`
    /// timestamps. Every other field of the stored record is kept.
    fn save_invocation(&self, record: &AgentRecord) -> Result<(), StoreError>;

    /// Raise the agent's watermark to `to`; a lower value leaves it as is.
    /// Returns the watermark as it was before the call.
    fn advance_watermark(&self, id: AgentId, to: MessageId) -> Result<MessageId, StoreError>;

    fn set_disabled(&self, id: AgentId, disabled: bool) -> Result<(), StoreError>;

    fn set_options(&self, id: AgentId, options: Map<String, Value>) -> Result<(), StoreError>;

    fn all(&self) -> Result<Vec<AgentRecord>, StoreError>;

    fn add_link(&self, link: Link) -> Result<(), StoreError>;

    fn links_to(&self, receiver: AgentId) -> Result<Vec<Link>, StoreError>;

    fn add_control_link(&self, link: ControlLink) -> Result<(), StoreError>;

    /// Control targets of `controller`, in the order they were declared.
    fn control_targets(&self, controller: AgentId) -> Result<Vec<AgentId>, StoreError>;
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::LockPoisoned(format!("{what} lock: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryMessageStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MessageTable {
    last_id: MessageId,
    rows: BTreeMap<MessageId, Message>,
}

/// Message store kept in process memory.
#[derive(Default)]
pub struct MemoryMessageStore {
    table: Mutex<MessageTable>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn create(
        &self,
        agent_id: AgentId,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Message, StoreError> {
        let mut table = lock(&self.table, "messages")?;
        table.last_id += 1;
        let message = Message {
            id: table.last_id,
            agent_id,
            payload,
            created_at: Utc::now(),
            expires_at,
        };
        table.rows.insert(message.id, message.clone());
        Ok(message)
    }

    fn query(&self, sources: &[AgentId], after: MessageId) -> Result<Vec<Message>, StoreError> {
        let table = lock(&self.table, "messages")?;
        Ok(table
            .rows
            .range(after.saturating_add(1)..)
            .map(|(_, m)| m)
            .filter(|m| sources.contains(&m.agent_id))
            .cloned()
            .collect())
    }

    fn get_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
        let table = lock(&self.table, "messages")?;
        let mut found: Vec<Message> = ids
            .iter()
            .filter_map(|id| table.rows.get(id))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.id);
        found.dedup_by_key(|m| m.id);
        Ok(found)
    }

    fn max_id(&self) -> Result<MessageId, StoreError> {
        Ok(lock(&self.table, "messages")?.last_id)
    }

    fn remove(&self, id: MessageId) -> Result<bool, StoreError> {
        Ok(lock(&self.table, "messages")?.rows.remove(&id).is_some())
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut table = lock(&self.table, "messages")?;
        let before = table.rows.len();
        table.rows.retain(|_, m| !m.is_expired(now));
        Ok(before - table.rows.len())
    }
}

// ---------------------------------------------------------------------------
// MemoryAgentStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AgentTable {
    last_id: AgentId,
    rows: BTreeMap<AgentId, AgentRecord>,
    links: Vec<Link>,
    control_links: Vec<ControlLink>,
}

/// Agent store kept in process memory.
#[derive(Default)]
pub struct MemoryAgentStore {
    table: Mutex<AgentTable>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<R>(&self, id: AgentId, f: impl FnOnce(&mut AgentRecord) -> R) -> Result<R, StoreError> {
        let mut table = lock(&self.table, "agents")?;
        let row = table.rows.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
        Ok(f(row))
    }
}

impl AgentStore for MemoryAgentStore {
    fn insert(&self, mut record: AgentRecord) -> Result<AgentRecord, StoreError> {
        let mut table = lock(&self.table, "agents")?;
        table.last_id += 1;
        record.id = table.last_id;
        table.rows.insert(record.id, record.clone());
        Ok(record)
    }

    fn get(&self, id: AgentId) -> Result<AgentRecord, StoreError> {
        lock(&self.table, "agents")?
            .rows
            .get(&id)
            .cloned()
            .ok_or(StoreError::AgentNotFound(id))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(lock(&self.table, "agents")?
            .rows
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.update(record.id, |row| *row = record.clone())
    }

    fn save_invocation(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.update(record.id, |row| {
            row.memory = record.memory.clone();
            row.last_check_at = record.last_check_at;
            row.last_receive_at = record.last_receive_at;
            row.last_message_at = record.last_message_at;
        })
    }

    fn advance_watermark(&self, id: AgentId, to: MessageId) -> Result<MessageId, StoreError> {
        self.update(id, |row| {
            let before = row.last_checked_message_id;
            row.last_checked_message_id = before.max(to);
            before
        })
    }

    fn set_disabled(&self, id: AgentId, disabled: bool) -> Result<(), StoreError> {
        self.update(id, |row| row.disabled = disabled)
    }

    fn set_options(&self, id: AgentId, options: Map<String, Value>) -> Result<(), StoreError> {
        self.update(id, |row| row.options = options)
    }

    fn all(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(lock(&self.table, "agents")?.rows.values().cloned().collect())
    }

    fn add_link(&self, link: Link) -> Result<(), StoreError> {
        lock(&self.table, "agents")?.links.push(link);
        Ok(())
    }

    fn links_to(&self, receiver: AgentId) -> Result<Vec<Link>, StoreError> {
        Ok(lock(&self.table, "agents")?
            .links
            .iter()
            .filter(|l| l.receiver_id == receiver)
            .copied()
            .collect())
    }

    fn add_control_link(&self, link: ControlLink) -> Result<(), StoreError> {
        lock(&self.table, "agents")?.control_links.push(link);
        Ok(())
    }

    fn control_targets(&self, controller: AgentId) -> Result<Vec<AgentId>, StoreError> {
        Ok(lock(&self.table, "agents")?
            .control_links
            .iter()
            .filter(|l| l.controller_id == controller)
            .map(|l| l.target_id)
            .collect())
    }
}
