use agentry::agent_manager::AgentRole;
use agentry::config::AgentryConfig;
use agentry::llm_client::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmError, TokenUsage};
use agentry::orchestrator::Orchestrator;
use agentry::ralph::{CommitDriver, QualityGate};
use agentry::realtime::{ClientRequest, EventKind, RealtimeEvent, Subscriber};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

const DEAD_SERVICE: &str = "http://127.0.0.1:9";

/// Routes canned responses by inspecting the transcript, so one client can
/// play product manager, code agent, and conversationalist.
struct ScriptedLlm;

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or("");
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");

        let content = if system.contains("Product Manager") {
            r#"{
                "name": "Reverse String",
                "description": "A string reversal helper",
                "branchName": "feature/reverse-string",
                "userStories": [{
                    "id": "US-001",
                    "title": "Reverse a string",
                    "description": "Implement a function that reverses its input",
                    "acceptanceCriteria": ["Handles empty strings", "Preserves unicode"],
                    "priority": 1
                }]
            }"#
            .to_string()
        } else if last.contains("# User Story:") {
            "Implementation below:\n\n```python:src/reverse.py\ndef reverse(s):\n    return s[::-1]\n```\n"
                .to_string()
        } else if last.contains("Synthesize the following") {
            "Synthesized summary of research and verification findings.".to_string()
        } else if last.contains("Verify the following topic") {
            "Verification: the claims check out.".to_string()
        } else {
            "Hello! How can I help?".to_string()
        };

        Ok(Completion {
            content,
            finish_reason: Some("stop".to_string()),
            model: "scripted".to_string(),
            usage: TokenUsage::default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct MockCommitDriver;

#[async_trait]
impl CommitDriver for MockCommitDriver {
    async fn checkout_branch(&self, _cwd: &Path, _branch: &str) -> bool {
        true
    }

    async fn commit(&self, _cwd: &Path, _message: &str) -> Option<String> {
        Some("abc123def4567890".to_string())
    }

    async fn push(&self, _cwd: &Path, _branch: &str) -> bool {
        true
    }
}

struct Collector {
    events: Mutex<Vec<RealtimeEvent>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn of_kind(&self, kind: EventKind) -> Vec<RealtimeEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl Subscriber for Collector {
    fn deliver(&self, event: &RealtimeEvent) -> bool {
        self.events.lock().unwrap().push(event.clone());
        true
    }
}

fn orchestrator(workspace: &Path) -> Orchestrator {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = AgentryConfig {
        workspace_root: workspace.to_path_buf(),
        project_root: workspace.join("project"),
        ralph_work_dir: workspace.join("ralph-work"),
        session_db: None,
        memory_service_url: DEAD_SERVICE.to_string(),
        ..AgentryConfig::default()
    };
    Orchestrator::new(config, Arc::new(ScriptedLlm))
        .with_commit_driver(Arc::new(MockCommitDriver))
        .with_quality_gate(QualityGate::disabled())
}

#[tokio::test]
async fn pure_chat_stays_conversational() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());
    let collector = Collector::new();
    orch.bus().subscribe(collector.clone());

    let reply = orch.chat("S1", "Hello!", false).await;
    assert_eq!(reply, "Hello! How can I help?");

    // Exactly two messages stored: user + assistant.
    let messages = orch.store().all_messages("S1").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "Hello!");
    assert_eq!(messages[1].role, "assistant");

    // No workflow was created.
    assert!(collector.of_kind(EventKind::WorkflowUpdate).is_empty());
}

#[tokio::test]
async fn code_request_runs_the_full_pipeline() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());

    let reply = orch
        .chat("S2", "Please create a Python function to reverse a string", false)
        .await;

    // The report celebrates the completed story and cites a commit ref.
    assert!(reply.contains("✅"));
    assert!(reply.contains("abc123de"));
    assert!(reply.contains("US-001"));
    assert!(reply.contains("feature/reverse-string"));

    // The artifact was written under generated/{story_id}/.
    let generated = workspace
        .path()
        .join("ralph-work")
        .join("generated")
        .join("US-001")
        .join("src")
        .join("reverse.py");
    assert!(generated.is_file());

    // The diary recorded a successful attempt.
    let diary_dir = workspace
        .path()
        .join(".copilot")
        .join("memory")
        .join("diary");
    let entries: Vec<_> = std::fs::read_dir(diary_dir).unwrap().collect();
    assert!(!entries.is_empty());
}

#[tokio::test]
async fn comprehensive_research_fans_out_and_reports_three_sections() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());
    let collector = Collector::new();
    orch.bus().subscribe(collector.clone());

    let reply = orch
        .chat("S4", "execute comprehensive research on quantum computing", false)
        .await;

    assert!(reply.contains("Workflow Execution Complete"));
    assert!(reply.contains("**Research Phase:**"));
    assert!(reply.contains("**Verification Phase:**"));
    assert!(reply.contains("**Synthesis:**"));
    assert!(reply.contains("Synthesized summary"));

    // Three agents were spawned with the canonical roles.
    assert_eq!(orch.agents().list_agents(None, Some(AgentRole::Research)).await.len(), 1);
    assert_eq!(orch.agents().list_agents(None, Some(AgentRole::Verify)).await.len(), 1);
    assert_eq!(orch.agents().list_agents(None, Some(AgentRole::Synthesis)).await.len(), 1);

    // Workflow phases were observed in order.
    let steps: Vec<String> = collector
        .of_kind(EventKind::WorkflowUpdate)
        .iter()
        .map(|e| {
            format!(
                "{}:{}",
                e.payload["status"].as_str().unwrap_or(""),
                e.payload["current_step"].as_str().unwrap_or("")
            )
        })
        .collect();
    let expected = [
        "started:initialization",
        "running:research_verify_parallel",
        "running:synthesis",
        "completed:",
    ];
    let mut cursor = 0;
    for step in &steps {
        if cursor < expected.len() && step == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "phases out of order: {:?}", steps);
}

#[tokio::test]
async fn research_request_parks_a_pending_task_for_later() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());

    // A research request without execution intent is parked.
    let first = orch.chat("S5", "study the history of rust", false).await;
    assert_eq!(first, "Hello! How can I help?");
    let pending = orch.store().get_context("S5", "pending_task").await.unwrap().unwrap();
    assert_eq!(pending, serde_json::json!("study the history of rust"));

    // A bare "go ahead" picks the parked task up and clears it.
    let second = orch.chat("S5", "go ahead", false).await;
    assert!(second.contains("Workflow Execution Complete"));
    assert!(second.contains("study the history of rust"));
    let cleared = orch.store().get_context("S5", "pending_task").await.unwrap();
    assert_eq!(cleared, Some(serde_json::Value::Null));
}

#[tokio::test]
async fn streaming_emits_chunks_and_a_final_response() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());
    let collector = Collector::new();
    orch.bus().subscribe(collector.clone());

    let reply = orch.chat("S6", "Hello!", true).await;

    let streams = collector.of_kind(EventKind::ChatStream);
    assert!(!streams.is_empty());
    let last = streams.last().unwrap();
    assert_eq!(last.payload["is_complete"], true);
    assert_eq!(last.payload["chunk"], reply.as_str());

    let responses = collector.of_kind(EventKind::ChatResponse);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload["content"], reply.as_str());
}

#[tokio::test]
async fn ping_frame_answers_with_pong() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());
    let collector = Collector::new();
    let id = orch.bus().subscribe(collector.clone());

    let reply = orch.handle_client_request(id, ClientRequest::Ping).await;
    assert!(reply.is_none());
    assert_eq!(collector.of_kind(EventKind::Pong).len(), 1);
}

#[tokio::test]
async fn chat_frame_streams_and_returns_the_reply() {
    let workspace = tempfile::tempdir().unwrap();
    let orch = orchestrator(workspace.path());
    let collector = Collector::new();
    let id = orch.bus().subscribe(collector.clone());

    let reply = orch
        .handle_client_request(
            id,
            ClientRequest::Chat {
                session_id: "S7".to_string(),
                message: "Hello!".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply, "Hello! How can I help?");
    assert!(!collector.of_kind(EventKind::ChatStream).is_empty());
}
