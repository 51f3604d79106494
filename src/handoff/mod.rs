//! Task ownership transfer between agents, in-process and via isolated
//! terminal workers.

mod manager;
mod registry;
mod terminal;

pub use manager::{
    AgentHandoff, AgentHandoffCounts, HandoffFilter, HandoffKind, HandoffManager, HandoffRecord,
    HandoffStats, TerminalStats,
};
pub use registry::{AgentDescriptor, AgentRegistry, InMemoryAgentRegistry};
pub use terminal::{TerminalInstance, TerminalOverrides, TerminalStatus};
