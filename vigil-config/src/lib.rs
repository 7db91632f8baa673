//! Deployment configuration for Vigil.
//!
//! Wraps the core [`OrchestratorConfig`](vigil_core::OrchestratorConfig)
//! with process-level settings (Redis endpoint, log filter) and the table of
//! command-line agents, and resolves it from files or the environment.

mod loader;
pub mod models;

pub use models::{CommandAgentSpec, VigilConfig, VigilConfigSource};
