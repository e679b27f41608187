//! Wire small agents into message-passing workflows.
//!
//! Agents run on a schedule (`check`) or in reaction to messages from the
//! agents they are linked to (`receive`). On top of that contract the crate
//! provides ordered emission ([`ordering`]), sandboxed dry runs
//! ([`Agent::dry_run`]) and lifecycle control of one agent by another
//! ([`control`]).
//!
//! # Quick start
//!
//! ```rust
//! use agent_mesh::{AgentSpec, Outcome, Runner, Workflow};
//! use serde_json::json;
//!
//! let wf = Workflow::builder("demo")
//!     .agent(AgentSpec::new("prices", "emitter").options(json!({
//!         "payloads": [{"price": 30}, {"price": 10}, {"price": 20}]
//!     })))
//!     .agent(AgentSpec::new("sorted", "digest").options(json!({
//!         "messages_order": [["{{ price }}", "number"]]
//!     })))
//!     .link("prices", "sorted")
//!     .build()
//!     .unwrap();
//!
//! let runner = Runner::new(wf);
//! let prices = runner.workflow().agent_by_name("prices").unwrap().id;
//! let sorted = runner.workflow().agent_by_name("sorted").unwrap().id;
//!
//! runner.invoke_check(prices).unwrap();
//! runner.propagate().unwrap();
//! runner.work_off();
//!
//! let Outcome::Completed { emitted } = runner.invoke_check(sorted).unwrap() else {
//!     panic!("digest was skipped");
//! };
//! let ordered: Vec<i64> = runner
//!     .workflow()
//!     .messages()
//!     .get_many(&emitted)
//!     .unwrap()
//!     .iter()
//!     .filter_map(|m| m.payload["price"].as_i64())
//!     .collect();
//! assert_eq!(ordered, vec![10, 20, 30]);
//! ```

mod agent;
pub mod behaviors;
pub mod config;
pub mod control;
mod ctx;
mod dry_run;
mod error;
mod jobs;
pub mod logs;
mod message;
pub mod ordering;
mod registry;
mod runner;
pub mod schedule;
mod sortable;
pub mod store;
pub mod template;
mod workflow;

pub use agent::{Agent, AgentBehavior, AgentId, AgentRecord, Capabilities};
pub use config::{ConfigError, WorkflowConfig};
pub use control::ControlAction;
pub use ctx::Ctx;
pub use dry_run::DryRunResult;
pub use error::{AgentError, FieldError, InvokeResult, StoreError, ValidationErrors};
pub use jobs::{Job, JobQueue};
pub use logs::{AgentLog, AgentLogs, LogLevel};
pub use message::{HasPayload, Message, MessageId};
pub use ordering::{KeyKind, OrderSpec, SortKey};
pub use registry::Registry;
pub use runner::{ErrorEvent, InvocationEvent, InvocationKind, Outcome, Runner, SkipReason, WorkReport};
pub use schedule::{Hour, Interval, Schedule};
pub use sortable::Sorted;
pub use template::{Interpolator, JinjaInterpolator};
pub use workflow::{AgentSpec, Workflow, WorkflowBuilder, WorkflowError};
