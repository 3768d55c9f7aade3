//! Agent lifecycle, parallel fan-out, and the inter-agent message fabric.
//!
//! The [`AgentManager`] is the central coordinator: it creates and terminates
//! agents, executes tasks against the shared [`LlmClient`] (optionally
//! injecting past learnings from the memory layer), fans batches of tasks out
//! in parallel, and routes messages between agents through one background
//! router task.
//!
//! # Messaging model
//!
//! Each agent owns a bounded **outbox** and a capped **inbox**.  The
//! back-pressure policy differs by direction, deliberately:
//!
//! - outbox full → the *sender* waits (correctness: nothing is lost);
//! - inbox full → the *oldest undelivered* message is dropped with a log
//!   (availability: a stuck consumer cannot wedge the fabric).
//!
//! A single long-lived router coroutine moves outbox messages onto recipient
//! inboxes; messages addressed to [`BROADCAST`] are multicast to every other
//! agent.  Per `(from, to)` pair, delivery order equals send order.  A panic
//! inside the router is fatal to the manager and requires a restart.
//!
//! # Error policy
//!
//! A task that fails inside the LLM client does **not** terminate the agent:
//! the failure is recorded on the attempt, the agent transitions back to
//! `completed` (so it can be reused), and the error is surfaced in the
//! returned [`TaskResult`].

use crate::agentry::llm_client::{truncate, ChatMessage, CompletionOptions, LlmClient};
use crate::agentry::memory::{DiaryEntry, Learning, MemoryClient};
use crate::agentry::realtime::{agent_channel, workflow_channel, EventKind, RealtimeBus, GLOBAL_CHANNEL};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Sentinel recipient id that multicasts to every other agent.
pub const BROADCAST: &str = "broadcast";

/// Default wall-clock budget for one `execute_task` call.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on concurrently executing agents in a parallel batch.
pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 8;

/// Outbox capacity per agent.  A full outbox blocks the sender.
const OUTBOX_CAPACITY: usize = 64;

/// Inbox capacity per agent.  A full inbox drops the oldest entry.
const INBOX_CAPACITY: usize = 256;

/// How often the router polls agent outboxes.
const ROUTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Predefined agent roles with specialized capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Research,
    Verify,
    Code,
    Synthesis,
    Review,
    Orchestrator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Research => "research",
            AgentRole::Verify => "verify",
            AgentRole::Code => "code",
            AgentRole::Synthesis => "synthesis",
            AgentRole::Review => "review",
            AgentRole::Orchestrator => "orchestrator",
        }
    }

    /// Parse a role name, falling back to `Research` for unknown strings.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "verify" => AgentRole::Verify,
            "code" => AgentRole::Code,
            "synthesis" => AgentRole::Synthesis,
            "review" => AgentRole::Review,
            "orchestrator" => AgentRole::Orchestrator,
            _ => AgentRole::Research,
        }
    }
}

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    /// Waiting for input or another agent.
    Waiting,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Paused => "paused",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Terminated => "terminated",
        }
    }
}

/// Static role template: the default system prompt and capability set used
/// when an agent is created without an explicit prompt.  New roles are added
/// by extending this registry, not by inheritance.
pub struct RoleTemplate {
    pub role: AgentRole,
    pub system_prompt: &'static str,
    pub capabilities: &'static [&'static str],
}

lazy_static! {
    static ref ROLE_TEMPLATES: HashMap<AgentRole, RoleTemplate> = {
        let mut templates = HashMap::new();
        templates.insert(
            AgentRole::Research,
            RoleTemplate {
                role: AgentRole::Research,
                system_prompt: "You are a Research Agent. Your task is to gather comprehensive information.\n\
                                Provide detailed, factual research with sources where possible.\n\
                                Focus on accuracy and completeness.",
                capabilities: &["web_search", "document_analysis", "fact_extraction"],
            },
        );
        templates.insert(
            AgentRole::Verify,
            RoleTemplate {
                role: AgentRole::Verify,
                system_prompt: "You are a Verification Agent. Your task is to validate and verify information.\n\
                                Cross-reference claims and provide confidence assessments.\n\
                                Be skeptical and thorough.",
                capabilities: &["fact_checking", "source_validation", "claim_analysis"],
            },
        );
        templates.insert(
            AgentRole::Code,
            RoleTemplate {
                role: AgentRole::Code,
                system_prompt: "You are a Code Agent. Your task is to write clean, efficient code.\n\
                                Follow best practices, include comments, and write tests.\n\
                                You can create new files and programs.",
                capabilities: &["code_generation", "file_operations", "testing"],
            },
        );
        templates.insert(
            AgentRole::Synthesis,
            RoleTemplate {
                role: AgentRole::Synthesis,
                system_prompt: "You are a Synthesis Agent. Your task is to combine and summarize information.\n\
                                Create coherent summaries from multiple sources.\n\
                                Highlight key insights and conclusions.",
                capabilities: &["summarization", "insight_extraction", "report_generation"],
            },
        );
        templates.insert(
            AgentRole::Review,
            RoleTemplate {
                role: AgentRole::Review,
                system_prompt: "You are a Review Agent. Your task is to review and critique work.\n\
                                Provide constructive feedback and suggestions for improvement.\n\
                                Be thorough but fair in your assessment.",
                capabilities: &["code_review", "document_review", "quality_assessment"],
            },
        );
        templates.insert(
            AgentRole::Orchestrator,
            RoleTemplate {
                role: AgentRole::Orchestrator,
                system_prompt: "You are the Lead Orchestrator. You coordinate specialized agents, \
                                delegate work, and assemble their results into coherent output.",
                capabilities: &["delegation", "coordination", "reporting"],
            },
        );
        templates
    };
}

/// Look up the static template for a role.
pub fn role_template(role: AgentRole) -> Option<&'static RoleTemplate> {
    ROLE_TEMPLATES.get(&role)
}

/// One message travelling between agents.  Delivered at most once per
/// recipient; ordering is preserved per `(from, to)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct InterAgentMessage {
    pub from_id: String,
    /// Recipient agent id, or [`BROADCAST`].
    pub to_id: String,
    pub kind: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// One recorded task attempt on an agent.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAttempt {
    pub task: String,
    pub success: bool,
    pub error: Option<String>,
    pub learnings_applied: usize,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of one `execute_task` call.  Errors are carried as values;
/// a failed task is still a returned result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub learnings_injected: usize,
}

impl TaskResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Serializable view of an agent for events and listings.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub model: String,
    pub capabilities: Vec<String>,
    pub parent_id: Option<String>,
    pub current_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub task_attempts: usize,
}

/// Registry record for one managed agent.
struct Agent {
    id: String,
    name: String,
    role: AgentRole,
    status: AgentStatus,
    system_prompt: String,
    model: String,
    capabilities: Vec<String>,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    current_task: Option<String>,
    task_history: Vec<TaskAttempt>,
    input_tokens: usize,
    output_tokens: usize,
    inbox: Arc<Mutex<VecDeque<InterAgentMessage>>>,
    outbox_tx: mpsc::Sender<InterAgentMessage>,
    cancel: Arc<Notify>,
}

impl Agent {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            status: self.status,
            model: self.model.clone(),
            capabilities: self.capabilities.clone(),
            parent_id: self.parent_id.clone(),
            current_task: self.current_task.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            task_attempts: self.task_history.len(),
        }
    }
}

/// Declarative agent creation request.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub role: AgentRole,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub parent_id: Option<String>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            system_prompt: None,
            model: None,
            capabilities: None,
            parent_id: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// How a parallel batch coordinates its participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationMode {
    /// Results are joined only at the end.
    Independent,
    /// Each result is broadcast as an `intermediate_result` the instant it
    /// finishes, so other agents (and subscribers) see partial progress.
    Collaborative,
    /// Like `Independent`, but the caller merges results in a fixed order
    /// downstream.
    SequentialMerge,
}

/// One entry in a parallel task batch.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub agent_id: String,
    pub task: String,
}

/// Combined result of the canonical research/verify/synthesize workflow.
#[derive(Debug, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub workflow_name: String,
    pub research: TaskResult,
    pub verify: TaskResult,
    pub synthesis: TaskResult,
    pub agent_ids: Vec<String>,
}

/// Errors surfaced by agent lifecycle operations.
#[derive(Debug, Clone)]
pub enum AgentError {
    /// The requested name is already used by a non-terminated agent.
    NameTaken(String),
    /// No agent with the given id exists.
    NotFound(String),
    /// `execute_workflow_parallel` was asked for a workflow it doesn't know.
    UnknownWorkflow(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::NameTaken(name) => write!(f, "agent with name '{}' already exists", name),
            AgentError::NotFound(id) => write!(f, "agent {} not found", id),
            AgentError::UnknownWorkflow(name) => write!(f, "unknown workflow: {}", name),
        }
    }
}

impl Error for AgentError {}

#[derive(Default)]
struct Registry {
    agents: HashMap<String, Agent>,
    by_name: HashMap<String, String>,
    outboxes: HashMap<String, mpsc::Receiver<InterAgentMessage>>,
}

/// Push onto a capped inbox, dropping the oldest entry when full.
async fn push_inbox(
    inbox: &Arc<Mutex<VecDeque<InterAgentMessage>>>,
    recipient: &str,
    message: InterAgentMessage,
) {
    let mut queue = inbox.lock().await;
    if queue.len() >= INBOX_CAPACITY {
        queue.pop_front();
        log::warn!("inbox full for agent {}, dropped oldest undelivered message", recipient);
    }
    queue.push_back(message);
}

/// Creates, coordinates, and terminates agents.  Shared via `Arc`.
pub struct AgentManager {
    llm: Arc<dyn LlmClient>,
    bus: Arc<RealtimeBus>,
    memory: Option<Arc<MemoryClient>>,
    default_model: String,
    registry: Arc<Mutex<Registry>>,
    parallelism: Arc<Semaphore>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl AgentManager {
    pub fn new(llm: Arc<dyn LlmClient>, bus: Arc<RealtimeBus>) -> Self {
        let default_model = llm.model_name().to_string();
        Self {
            llm,
            bus,
            memory: None,
            default_model,
            registry: Arc::new(Mutex::new(Registry::default())),
            parallelism: Arc::new(Semaphore::new(DEFAULT_MAX_PARALLEL_AGENTS)),
            router: Mutex::new(None),
        }
    }

    /// Attach the learning memory (builder pattern).  Without it, learning
    /// injection and diary logging are silently skipped.
    pub fn with_memory(mut self, memory: Arc<MemoryClient>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override the parallel-execution bound (builder pattern).
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.parallelism = Arc::new(Semaphore::new(max_parallel.max(1)));
        self
    }

    /// Start the background message router.  Must be called before
    /// inter-agent messaging is used; idempotent.
    pub async fn start(&self) {
        let mut router = self.router.lock().await;
        if router.is_some() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        *router = Some(tokio::spawn(route_messages(registry, bus)));
        log::info!("agent manager started");
    }

    /// Stop the router and terminate every agent.
    pub async fn stop(&self) {
        if let Some(handle) = self.router.lock().await.take() {
            handle.abort();
        }
        let ids: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.agents.keys().cloned().collect()
        };
        for id in ids {
            self.terminate_agent(&id).await;
        }
        log::info!("agent manager stopped");
    }

    /// Create a new managed agent.
    ///
    /// Rejects the spec when the name is already used by a live agent.  When
    /// no system prompt is given, the static role template supplies one.
    pub async fn create_agent(&self, spec: AgentSpec) -> Result<AgentSnapshot, AgentError> {
        let mut registry = self.registry.lock().await;
        if registry.by_name.contains_key(&spec.name) {
            return Err(AgentError::NameTaken(spec.name));
        }

        let template = role_template(spec.role);
        let system_prompt = spec.system_prompt.unwrap_or_else(|| {
            template
                .map(|t| t.system_prompt.to_string())
                .unwrap_or_else(|| format!("You are a {} agent.", spec.role.as_str()))
        });
        let capabilities = spec.capabilities.unwrap_or_else(|| {
            template
                .map(|t| t.capabilities.iter().map(|c| c.to_string()).collect())
                .unwrap_or_default()
        });

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let agent = Agent {
            id: id.clone(),
            name: spec.name.clone(),
            role: spec.role,
            status: AgentStatus::Pending,
            system_prompt,
            model: spec.model.unwrap_or_else(|| self.default_model.clone()),
            capabilities,
            parent_id: spec.parent_id,
            created_at: now,
            updated_at: now,
            current_task: None,
            task_history: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            outbox_tx,
            cancel: Arc::new(Notify::new()),
        };
        let snapshot = agent.snapshot();

        registry.by_name.insert(spec.name.clone(), id.clone());
        registry.outboxes.insert(id.clone(), outbox_rx);
        registry.agents.insert(id.clone(), agent);
        drop(registry);

        log::info!("created agent: {} (id: {}, role: {})", spec.name, id, spec.role.as_str());
        self.bus.broadcast(
            GLOBAL_CHANNEL,
            EventKind::AgentCreated,
            serde_json::json!({ "agent": snapshot }),
        );

        Ok(snapshot)
    }

    /// Terminate an agent: cancel its in-flight task, drain and discard its
    /// inbox, then remove it from the registry.  Returns `false` when no
    /// such agent exists.
    pub async fn terminate_agent(&self, agent_id: &str) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            let Some(agent) = registry.agents.remove(agent_id) else {
                return false;
            };
            registry.by_name.remove(&agent.name);
            registry.outboxes.remove(agent_id);
            agent
        };

        removed.cancel.notify_waiters();
        removed.inbox.lock().await.clear();

        self.bus.broadcast(
            &agent_channel(agent_id),
            EventKind::AgentStatusChanged,
            serde_json::json!({
                "agent_id": agent_id,
                "old_status": removed.status.as_str(),
                "new_status": AgentStatus::Terminated.as_str(),
            }),
        );
        self.bus.broadcast(
            GLOBAL_CHANNEL,
            EventKind::AgentDeleted,
            serde_json::json!({ "agent_id": agent_id }),
        );

        log::info!("terminated agent: {}", removed.name);
        true
    }

    /// Snapshot one agent by id.
    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let registry = self.registry.lock().await;
        registry.agents.get(agent_id).map(|a| a.snapshot())
    }

    /// Snapshot one agent by its unique name.
    pub async fn agent_by_name(&self, name: &str) -> Option<AgentSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .by_name
            .get(name)
            .and_then(|id| registry.agents.get(id))
            .map(|a| a.snapshot())
    }

    /// Snapshot all agents, optionally filtered by status and/or role.
    pub async fn list_agents(
        &self,
        status: Option<AgentStatus>,
        role: Option<AgentRole>,
    ) -> Vec<AgentSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .agents
            .values()
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .filter(|a| role.map(|r| a.role == r).unwrap_or(true))
            .map(|a| a.snapshot())
            .collect()
    }

    /// Pop the next pending message from an agent's inbox, if any.
    pub async fn pop_message(&self, agent_id: &str) -> Option<InterAgentMessage> {
        let inbox = {
            let registry = self.registry.lock().await;
            Arc::clone(&registry.agents.get(agent_id)?.inbox)
        };
        let mut queue = inbox.lock().await;
        queue.pop_front()
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        let old_status = {
            let mut registry = self.registry.lock().await;
            let Some(agent) = registry.agents.get_mut(agent_id) else {
                return;
            };
            let old = agent.status;
            agent.status = status;
            agent.updated_at = Utc::now();
            old
        };
        self.bus.broadcast(
            &agent_channel(agent_id),
            EventKind::AgentStatusChanged,
            serde_json::json!({
                "agent_id": agent_id,
                "old_status": old_status.as_str(),
                "new_status": status.as_str(),
            }),
        );
    }

    /// Execute a task with an agent.
    ///
    /// Composes the prompt from the agent's system prompt, (optionally) the
    /// top-3 past learnings retrieved for the task text, and the task
    /// itself; calls the LLM under `timeout`; records the attempt in the
    /// agent's history; emits progress events on `agent:{id}`; and writes a
    /// diary entry.  Timeout expiry cancels the underlying call and records
    /// `error = "timeout"`.
    pub async fn execute_task(
        &self,
        agent_id: &str,
        task: &str,
        timeout: Duration,
        inject_learnings: bool,
    ) -> TaskResult {
        // Snapshot what the call needs, then release the registry for the
        // duration of the LLM round-trip.
        let (system_prompt, role, cancel, attempt_no, agent_name) = {
            let mut registry = self.registry.lock().await;
            let Some(agent) = registry.agents.get_mut(agent_id) else {
                return TaskResult::failed(format!("Agent {} not found", agent_id));
            };
            agent.current_task = Some(task.to_string());
            (
                agent.system_prompt.clone(),
                agent.role,
                Arc::clone(&agent.cancel),
                agent.task_history.len() as u32 + 1,
                agent.name.clone(),
            )
        };
        self.set_status(agent_id, AgentStatus::Running).await;

        let learnings = if inject_learnings {
            self.query_learnings(task, role).await
        } else {
            Vec::new()
        };
        let enhanced = enhance_task_with_learnings(task, &learnings);

        self.bus.broadcast(
            &agent_channel(agent_id),
            EventKind::AgentLog,
            serde_json::json!({
                "agent_id": agent_id,
                "type": "task_start",
                "task": task,
                "learnings_injected": learnings.len(),
            }),
        );

        let messages = vec![
            ChatMessage::system(system_prompt.as_str()),
            ChatMessage::user(enhanced.as_str()),
        ];
        let opts = CompletionOptions::default();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.llm.complete(&messages, &opts)) => {
                match result {
                    Err(_) => Err("timeout".to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Ok(Ok(completion)) => Ok(completion),
                }
            }
            _ = cancel.notified() => Err("terminated".to_string()),
        };

        let result = match outcome {
            Ok(completion) => {
                let mut registry = self.registry.lock().await;
                if let Some(agent) = registry.agents.get_mut(agent_id) {
                    agent.input_tokens += completion.usage.prompt_tokens;
                    agent.output_tokens += completion.usage.completion_tokens;
                }
                TaskResult {
                    output: Some(completion.content),
                    error: None,
                    model: Some(completion.model),
                    learnings_injected: learnings.len(),
                }
            }
            Err(error) => TaskResult {
                output: None,
                error: Some(error),
                model: None,
                learnings_injected: learnings.len(),
            },
        };

        let success = result.is_success();
        {
            let mut registry = self.registry.lock().await;
            if let Some(agent) = registry.agents.get_mut(agent_id) {
                agent.current_task = None;
                agent.task_history.push(TaskAttempt {
                    task: task.to_string(),
                    success,
                    error: result.error.clone(),
                    learnings_applied: learnings.len(),
                    timestamp: Utc::now(),
                });
            }
        }
        // A failed LLM call does not kill the agent; it stays reusable.
        self.set_status(agent_id, AgentStatus::Completed).await;

        if let Some(memory) = &self.memory {
            let mut entry = DiaryEntry::new(
                format!("task-{}-{}", agent_id, attempt_no),
                truncate(task, 100),
                attempt_no,
                success,
            )
            .with_changes(if success { 1 } else { 0 })
            .with_metadata(serde_json::json!({
                "agent_id": agent_id,
                "agent_name": agent_name,
            }));
            if let Some(output) = &result.output {
                entry = entry.with_code_excerpt(output);
            }
            if let Some(error) = &result.error {
                entry = entry.with_error(error.clone());
            }
            if let Err(e) = memory.diary(entry).await {
                log::warn!("failed to write diary entry: {}", e);
            }
        }

        self.bus.broadcast(
            &agent_channel(agent_id),
            EventKind::AgentLog,
            serde_json::json!({
                "agent_id": agent_id,
                "type": "task_complete",
                "success": success,
                "error": result.error,
            }),
        );

        result
    }

    async fn query_learnings(&self, task: &str, role: AgentRole) -> Vec<Learning> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        let learnings = memory
            .query_past_learnings(task, &["ralph", "learning", role.as_str()], 3, 0.6)
            .await;
        if !learnings.is_empty() {
            log::info!("injected {} past learnings into task prompt", learnings.len());
        }
        learnings
    }

    /// Fan a batch of tasks out concurrently, bounded by the configured
    /// parallelism, and join the results by agent id.
    pub async fn execute_parallel_tasks(
        &self,
        specs: Vec<TaskSpec>,
        mode: CoordinationMode,
        timeout: Duration,
    ) -> HashMap<String, TaskResult> {
        let agent_ids: Vec<String> = specs.iter().map(|s| s.agent_id.clone()).collect();
        self.bus.broadcast(
            GLOBAL_CHANNEL,
            EventKind::AgentCollaboration,
            serde_json::json!({
                "agent_ids": agent_ids,
                "topic": "Parallel task execution",
                "status": "started",
            }),
        );

        let futures = specs.into_iter().map(|spec| {
            let permit_pool = Arc::clone(&self.parallelism);
            async move {
                let _permit = permit_pool.acquire().await.ok();
                let result = self.execute_task(&spec.agent_id, &spec.task, timeout, true).await;
                if mode == CoordinationMode::Collaborative {
                    self.bus.broadcast(
                        GLOBAL_CHANNEL,
                        EventKind::AgentMessage,
                        serde_json::json!({
                            "message_type": "intermediate_result",
                            "from_agent": spec.agent_id,
                            "to_agent": BROADCAST,
                            "message": result.output.as_deref().unwrap_or("No output"),
                        }),
                    );
                }
                (spec.agent_id, result)
            }
        });
        let results: HashMap<String, TaskResult> = join_all(futures).await.into_iter().collect();

        self.bus.broadcast(
            GLOBAL_CHANNEL,
            EventKind::AgentCollaboration,
            serde_json::json!({
                "agent_ids": agent_ids,
                "topic": "Parallel task execution",
                "status": "completed",
            }),
        );

        results
    }

    /// Run the canonical `research_verify_synthesize` workflow:
    ///
    /// 1. create research, verify, and synthesis agents;
    /// 2. run research and verify in parallel (collaborative mode);
    /// 3. synthesize both outputs verbatim;
    /// 4. return all three results plus the agent ids.
    pub async fn execute_workflow_parallel(
        &self,
        workflow_name: &str,
        task: &str,
        parent_id: Option<&str>,
    ) -> Result<WorkflowOutcome, AgentError> {
        if workflow_name != "research_verify_synthesize" {
            return Err(AgentError::UnknownWorkflow(workflow_name.to_string()));
        }

        let workflow_id = uuid::Uuid::new_v4().to_string();
        let short_id = &workflow_id[..8];
        let channel = workflow_channel(&workflow_id);
        self.bus.broadcast(
            &channel,
            EventKind::WorkflowUpdate,
            serde_json::json!({
                "workflow_id": workflow_id,
                "status": "started",
                "current_step": "initialization",
            }),
        );

        let mut research_spec = AgentSpec::new(format!("Research-{}", short_id), AgentRole::Research);
        let mut verify_spec = AgentSpec::new(format!("Verify-{}", short_id), AgentRole::Verify);
        let mut synthesis_spec = AgentSpec::new(format!("Synthesis-{}", short_id), AgentRole::Synthesis);
        if let Some(parent) = parent_id {
            research_spec = research_spec.with_parent(parent);
            verify_spec = verify_spec.with_parent(parent);
            synthesis_spec = synthesis_spec.with_parent(parent);
        }
        let research = self.create_agent(research_spec).await?;
        let verify = self.create_agent(verify_spec).await?;
        let synthesis = self.create_agent(synthesis_spec).await?;

        self.bus.broadcast(
            &channel,
            EventKind::WorkflowUpdate,
            serde_json::json!({
                "workflow_id": workflow_id,
                "status": "running",
                "current_step": "research_verify_parallel",
            }),
        );

        let mut parallel = self
            .execute_parallel_tasks(
                vec![
                    TaskSpec {
                        agent_id: research.id.clone(),
                        task: task.to_string(),
                    },
                    TaskSpec {
                        agent_id: verify.id.clone(),
                        task: format!("Verify the following topic: {}", task),
                    },
                ],
                CoordinationMode::Collaborative,
                DEFAULT_TASK_TIMEOUT,
            )
            .await;
        let research_result = parallel.remove(&research.id).unwrap_or_default();
        let verify_result = parallel.remove(&verify.id).unwrap_or_default();

        self.bus.broadcast(
            &channel,
            EventKind::WorkflowUpdate,
            serde_json::json!({
                "workflow_id": workflow_id,
                "status": "running",
                "current_step": "synthesis",
            }),
        );

        let synthesis_task = format!(
            "Synthesize the following research and verification results:\n\n\
             Research Results:\n{}\n\n\
             Verification Results:\n{}\n\n\
             Provide a coherent summary with key insights.",
            research_result.output.as_deref().unwrap_or("No research results"),
            verify_result.output.as_deref().unwrap_or("No verification results"),
        );
        let synthesis_result = self
            .execute_task(&synthesis.id, &synthesis_task, DEFAULT_TASK_TIMEOUT, true)
            .await;

        let outcome = WorkflowOutcome {
            workflow_id: workflow_id.clone(),
            workflow_name: workflow_name.to_string(),
            research: research_result,
            verify: verify_result,
            synthesis: synthesis_result,
            agent_ids: vec![research.id, verify.id, synthesis.id],
        };

        self.bus.broadcast(
            &channel,
            EventKind::WorkflowUpdate,
            serde_json::json!({
                "workflow_id": workflow_id,
                "status": "completed",
                "current_step": serde_json::Value::Null,
            }),
        );

        Ok(outcome)
    }

    /// Enqueue a message from one agent to another (or to [`BROADCAST`]).
    ///
    /// The message goes onto the sender's bounded outbox; when the outbox is
    /// full this call waits until the router has drained room.
    pub async fn send_message(
        &self,
        from_id: &str,
        to_id: &str,
        body: &str,
        kind: &str,
    ) -> Result<(), AgentError> {
        let tx = {
            let registry = self.registry.lock().await;
            let agent = registry
                .agents
                .get(from_id)
                .ok_or_else(|| AgentError::NotFound(from_id.to_string()))?;
            agent.outbox_tx.clone()
        };
        let message = InterAgentMessage {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        };
        tx.send(message)
            .await
            .map_err(|_| AgentError::NotFound(from_id.to_string()))
    }
}

/// The single long-lived router coroutine.
///
/// Polls every agent outbox, moves messages onto recipient inboxes
/// (multicasting [`BROADCAST`]), and mirrors each delivery onto the sender's
/// realtime channel.  Errors in individual deliveries never propagate; only
/// cancellation (manager stop) ends the loop.
async fn route_messages(registry: Arc<Mutex<Registry>>, bus: Arc<RealtimeBus>) {
    loop {
        {
            let mut reg = registry.lock().await;
            let mut pending = Vec::new();
            for rx in reg.outboxes.values_mut() {
                while let Ok(message) = rx.try_recv() {
                    pending.push(message);
                }
            }
            for message in pending {
                if message.to_id == BROADCAST {
                    let inboxes: Vec<(String, Arc<Mutex<VecDeque<InterAgentMessage>>>)> = reg
                        .agents
                        .values()
                        .filter(|a| a.id != message.from_id)
                        .map(|a| (a.id.clone(), Arc::clone(&a.inbox)))
                        .collect();
                    for (recipient, inbox) in inboxes {
                        push_inbox(&inbox, &recipient, message.clone()).await;
                    }
                } else if let Some(agent) = reg.agents.get(&message.to_id) {
                    let inbox = Arc::clone(&agent.inbox);
                    let recipient = agent.id.clone();
                    push_inbox(&inbox, &recipient, message.clone()).await;
                } else {
                    log::debug!(
                        "dropping message for unknown agent {} (from {})",
                        message.to_id,
                        message.from_id
                    );
                }

                bus.broadcast(
                    &agent_channel(&message.from_id),
                    EventKind::AgentMessage,
                    serde_json::json!({
                        "message_type": message.kind,
                        "from_agent": message.from_id,
                        "to_agent": message.to_id,
                        "message": message.body,
                    }),
                );
            }
        }
        tokio::time::sleep(ROUTER_POLL_INTERVAL).await;
    }
}

/// Append a "Relevant Past Learnings" section to a task prompt.
fn enhance_task_with_learnings(task: &str, learnings: &[Learning]) -> String {
    if learnings.is_empty() {
        return task.to_string();
    }

    let mut enhanced = format!("{}\n\n---\n## Relevant Past Learnings\n\n", task);
    for (i, learning) in learnings.iter().take(3).enumerate() {
        enhanced.push_str(&format!("### Learning {}\n", i + 1));
        if !learning.content.is_empty() {
            enhanced.push_str(&truncate(&learning.content, 300));
            enhanced.push('\n');
        }
        if !learning.insights.is_empty() {
            enhanced.push_str("\n**Insights:**\n");
            for insight in learning.insights.iter().take(2) {
                enhanced.push_str(&format!("- {}\n", insight));
            }
        }
        if !learning.recommendations.is_empty() {
            enhanced.push_str("\n**Recommendations:**\n");
            for rec in learning.recommendations.iter().take(2) {
                enhanced.push_str(&format!("- {}\n", rec));
            }
        }
        enhanced.push('\n');
    }
    enhanced.push_str("---\n\nApply these learnings to improve your approach to the current task.\n");
    enhanced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_a_template() {
        for role in [
            AgentRole::Research,
            AgentRole::Verify,
            AgentRole::Code,
            AgentRole::Synthesis,
            AgentRole::Review,
            AgentRole::Orchestrator,
        ] {
            assert!(role_template(role).is_some(), "missing template for {:?}", role);
        }
    }

    #[test]
    fn unknown_role_parses_to_research() {
        assert_eq!(AgentRole::parse("code"), AgentRole::Code);
        assert_eq!(AgentRole::parse("whatever"), AgentRole::Research);
    }

    #[test]
    fn learnings_section_is_appended() {
        let learning = Learning {
            content: "Past attempt failed on imports".to_string(),
            kind: "reflection".to_string(),
            score: 0.9,
            story_id: None,
            story_title: None,
            insights: vec!["Check imports first".to_string()],
            recommendations: vec![],
        };
        let enhanced = enhance_task_with_learnings("Do the thing", &[learning]);
        assert!(enhanced.starts_with("Do the thing"));
        assert!(enhanced.contains("## Relevant Past Learnings"));
        assert!(enhanced.contains("Check imports first"));

        assert_eq!(enhance_task_with_learnings("plain", &[]), "plain");
    }
}
