//! Long-running tasks: the worker pool and its housekeeper.

pub mod supervisor;

pub use supervisor::{AgentPool, OutcomeSink};
