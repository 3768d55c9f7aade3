//! Configuration for the orchestration core.
//!
//! [`AgentryConfig`] is constructed by hand, with no config-file parsing
//! dependencies.  Every field has a sensible default; override what you
//! need:
//!
//! ```rust
//! use agentry::config::AgentryConfig;
//! use std::path::PathBuf;
//!
//! let config = AgentryConfig {
//!     workspace_root: PathBuf::from("/var/lib/agentry"),
//!     max_parallel_agents: 4,
//!     ..AgentryConfig::default()
//! };
//! assert_eq!(config.max_messages_per_session, 100);
//! ```

use crate::agentry::ralph::QualityGateMode;
use chrono::Duration;
use std::path::PathBuf;

/// Global settings shared by the orchestrator and its subsystems.
pub struct AgentryConfig {
    /// Root under which the memory tree (`.copilot/memory/`) lives.
    pub workspace_root: PathBuf,
    /// Project tree the Ralph loop checks branches out in and runs quality
    /// checks against.
    pub project_root: PathBuf,
    /// Where generated artifacts and loop progress are written.
    pub ralph_work_dir: PathBuf,
    /// Session database path; `None` selects the in-memory store.
    pub session_db: Option<PathBuf>,
    /// Sessions expire after this long without access.
    pub session_ttl: Duration,
    /// Cap on stored messages per session; oldest evicted beyond it.
    pub max_messages_per_session: usize,
    /// Base URL of the external memory service.
    pub memory_service_url: String,
    /// Bound on concurrently executing agents in parallel batches.
    pub max_parallel_agents: usize,
    /// Whether failed quality checks block an attempt.
    pub quality_gate_mode: QualityGateMode,
    /// Iteration cap for one Ralph run.
    pub ralph_max_iterations: usize,
    /// Retry budget per story.
    pub ralph_max_retries: u32,
}

impl Default for AgentryConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            project_root: PathBuf::from("ralph-projects"),
            ralph_work_dir: PathBuf::from("ralph-work"),
            session_db: Some(PathBuf::from("agentry-sessions.db")),
            session_ttl: Duration::hours(24),
            max_messages_per_session: 100,
            memory_service_url: "http://localhost:8002".to_string(),
            max_parallel_agents: 8,
            quality_gate_mode: QualityGateMode::Soft,
            ralph_max_iterations: 50,
            ralph_max_retries: 3,
        }
    }
}
