// src/lib.rs

// Import the top-level `agentry` module.
pub mod agentry;

// Re-export the submodules and key types at the crate root so callers can
// write `agentry::ralph::RalphLoop` instead of walking the full hierarchy.
pub use agentry::agent_manager;
pub use agentry::config;
pub use agentry::llm_client;
pub use agentry::memory;
pub use agentry::orchestrator;
pub use agentry::prd_builder;
pub use agentry::ralph;
pub use agentry::realtime;
pub use agentry::session_store;

pub use agentry::agent_manager::{AgentManager, AgentRole, AgentStatus};
pub use agentry::llm_client::{ChatMessage, ChatRole, LlmClient};
pub use agentry::orchestrator::Orchestrator;
pub use agentry::ralph::{Prd, RalphLoop, UserStory};
