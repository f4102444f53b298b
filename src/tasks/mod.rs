//! Tasks — model, the agent loop, and the task queue processor.

pub mod agent_loop;
pub mod model;
pub mod processor;

pub use agent_loop::{AgentLoop, AgentLoopDeps, LoopOutcome};
pub use model::{QueueItem, QueueKind, QueueStatus, Task, TaskStatus};
pub use processor::TaskProcessor;
