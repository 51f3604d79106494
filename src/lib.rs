//! Agent coordination core for charter-flight request pipelines.
//!
//! Four components, bottom-up: a publish/subscribe [`bus`] for inter-agent
//! signaling, a [`workflow`] state machine enforcing legal transitions per
//! unit of work, a durable [`queue`] for asynchronous execution, and a
//! [`handoff`] manager that transfers task ownership between agents,
//! including delegation to isolated out-of-process workers via [`spawn`].

pub mod bus;
pub mod config;
pub mod error;
pub mod git;
pub mod handoff;
pub mod queue;
pub mod spawn;
pub mod task;
pub mod workflow;

pub use bus::{Message, MessageBus, MessageDraft, MessageFilter, MessagePayload, MessageType};
pub use config::{BusConfig, FlowConfig, QueueConfig, TerminalConfig, WorkflowConfig};
pub use error::{FlowError, Result};
pub use handoff::{
    AgentDescriptor, AgentHandoff, AgentRegistry, HandoffManager, InMemoryAgentRegistry,
    TerminalInstance, TerminalOverrides, TerminalStatus,
};
pub use queue::{JobProcessor, JobState, JobStatus, QueueEvent, QueueOptions, TaskQueue};
pub use spawn::{ProcessSpawner, SpawnedWorker, TerminalLaunchSpec, WorkerExit, WorkerSpawner};
pub use task::{AgentContext, AgentTask, TaskPriority, TaskStatus};
pub use workflow::{WorkflowManager, WorkflowState, WorkflowStateMachine};
