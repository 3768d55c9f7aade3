use agentry::agent_manager::AgentManager;
use agentry::llm_client::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmError, TokenUsage};
use agentry::memory::MemoryClient;
use agentry::ralph::{
    CommitDriver, Prd, ProgressRecord, QualityGate, QualityGateMode, RalphLoop, StoryStatus,
    UserStory,
};
use agentry::realtime::RealtimeBus;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DEAD_SERVICE: &str = "http://127.0.0.1:9";

/// Always emits one labelled file artifact.
struct ArtifactLlm;

#[async_trait]
impl LlmClient for ArtifactLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: "Here is the implementation:\n\n\
                      ```python:src/reverse.py\ndef reverse(s):\n    return s[::-1]\n```\n"
                .to_string(),
            finish_reason: Some("stop".to_string()),
            model: "mock".to_string(),
            usage: TokenUsage::default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "artifact-mock"
    }
}

/// Talks a lot, produces no code blocks.
struct ProseLlm;

#[async_trait]
impl LlmClient for ProseLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: "I would approach this by first considering the requirements.".to_string(),
            finish_reason: Some("stop".to_string()),
            model: "mock".to_string(),
            usage: TokenUsage::default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "prose-mock"
    }
}

/// Records commits, hands out a fixed ref.
struct MockCommitDriver {
    commits: Mutex<Vec<String>>,
}

impl MockCommitDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            commits: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CommitDriver for MockCommitDriver {
    async fn checkout_branch(&self, _cwd: &Path, _branch: &str) -> bool {
        true
    }

    async fn commit(&self, _cwd: &Path, message: &str) -> Option<String> {
        self.commits.lock().unwrap().push(message.to_string());
        Some("abc123def4567890".to_string())
    }

    async fn push(&self, _cwd: &Path, _branch: &str) -> bool {
        true
    }
}

struct Fixture {
    _workspace: tempfile::TempDir,
    work_dir: PathBuf,
    memory: Arc<MemoryClient>,
    agents: Arc<AgentManager>,
    commit_driver: Arc<MockCommitDriver>,
}

fn fixture(llm: Arc<dyn LlmClient>) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let workspace = tempfile::tempdir().unwrap();
    let work_dir = workspace.path().join("ralph-work");
    let memory = Arc::new(MemoryClient::new(DEAD_SERVICE, workspace.path()).unwrap());
    let agents = Arc::new(AgentManager::new(llm, Arc::new(RealtimeBus::new())));
    Fixture {
        work_dir,
        memory,
        agents,
        commit_driver: MockCommitDriver::new(),
        _workspace: workspace,
    }
}

fn loop_for(fixture: &Fixture, prd: Prd) -> RalphLoop {
    let driver: Arc<dyn CommitDriver> = fixture.commit_driver.clone();
    RalphLoop::new(
        prd,
        fixture.work_dir.clone(),
        fixture.work_dir.clone(),
        Arc::clone(&fixture.agents),
    )
    .with_memory(Arc::clone(&fixture.memory))
    .with_commit_driver(driver)
    .with_quality_gate(QualityGate::disabled(), QualityGateMode::Soft)
}

fn one_story_prd() -> Prd {
    Prd::new(
        "String tools",
        "Utilities",
        "feature/string-tools",
        vec![UserStory::new(
            "US-001",
            "Reverse a string",
            "Implement string reversal",
            vec!["Handles empty input".to_string()],
            1,
        )],
    )
}

#[tokio::test]
async fn story_completes_on_first_attempt() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let mut ralph = loop_for(&fixture, one_story_prd());

    let summary = ralph.run().await;

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.stories.completed, 1);
    assert_eq!(summary.stories.failed, 0);
    assert_eq!(summary.stories.completion_percentage, 100.0);
    assert_eq!(summary.total_attempts, 1);

    let story = &summary.completed_stories[0];
    assert_eq!(story.attempts, 1);
    assert!(story.completed_at.is_some());
    assert_eq!(story.commit_ref.as_deref(), Some("abc123def4567890"));

    // The artifact landed under generated/{story_id}/.
    let generated = fixture
        .work_dir
        .join("generated")
        .join("US-001")
        .join("src")
        .join("reverse.py");
    let body = std::fs::read_to_string(generated).unwrap();
    assert!(body.contains("def reverse"));

    // One successful diary entry, one reflection.
    let diary = fixture.memory.diary_entries(Some("US-001"), 10);
    assert_eq!(diary.len(), 1);
    assert!(diary[0].1.contains("✅ Success"));
    assert_eq!(fixture.memory.reflections(Some("US-001"), 10).len(), 1);

    // The commit message references the story.
    let commits = fixture.commit_driver.commits.lock().unwrap();
    assert!(commits[0].starts_with("feat(US-001): Reverse a string"));
}

#[tokio::test]
async fn retries_exhaust_into_failed_story() {
    let fixture = fixture(Arc::new(ProseLlm));
    let mut ralph = loop_for(&fixture, one_story_prd())
        .with_max_retries(3)
        .with_max_iterations(10);

    let summary = ralph.run().await;

    assert_eq!(summary.status, "partial");
    assert_eq!(summary.stories.completed, 0);
    assert_eq!(summary.stories.failed, 1);
    assert_eq!(summary.total_attempts, 3);

    let story = &summary.failed_stories[0];
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.attempts, 3);
    assert_eq!(story.last_error.as_deref(), Some("No code changes applied"));

    // One diary entry per attempt, exactly one (failed) reflection.
    assert_eq!(fixture.memory.diary_entries(Some("US-001"), 10).len(), 3);
    let reflections = fixture.memory.reflections(Some("US-001"), 10);
    assert_eq!(reflections.len(), 1);
    assert!(reflections[0].1.contains("❌ Failed"));

    // Nothing was committed.
    assert!(fixture.commit_driver.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_prd_terminates_immediately() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let prd = Prd::new("Empty", "Nothing", "feature/empty", vec![]);
    let mut ralph = loop_for(&fixture, prd);

    let summary = ralph.run().await;
    assert_eq!(summary.status, "completed");
    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.stories.total, 0);
}

#[tokio::test]
async fn unknown_dependency_is_never_picked() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let blocked = UserStory::new("US-001", "Blocked", "d", vec![], 1)
        .with_dependencies(vec!["US-999".to_string()]);
    let prd = Prd::new("Blocked", "d", "feature/blocked", vec![blocked]);
    let mut ralph = loop_for(&fixture, prd);

    let summary = ralph.run().await;

    assert_eq!(summary.status, "partial");
    assert_eq!(summary.stories.completed, 0);
    assert_eq!(summary.total_attempts, 0);
    // No attempt means no diary entry.
    assert!(fixture.memory.diary_entries(Some("US-001"), 10).is_empty());
}

#[tokio::test]
async fn dependencies_run_before_dependents() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let base = UserStory::new("base", "Base", "d", vec![], 2);
    let top = UserStory::new("top", "Top", "d", vec![], 1)
        .with_dependencies(vec!["base".to_string()]);
    let prd = Prd::new("Deps", "d", "feature/deps", vec![base, top]);
    let mut ralph = loop_for(&fixture, prd);

    let summary = ralph.run().await;

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.stories.completed, 2);
    // `top` has higher priority but had to wait for `base`.
    let base_done = summary
        .completed_stories
        .iter()
        .find(|s| s.id == "base")
        .unwrap()
        .completed_at
        .unwrap();
    let top_done = summary
        .completed_stories
        .iter()
        .find(|s| s.id == "top")
        .unwrap()
        .completed_at
        .unwrap();
    assert!(base_done <= top_done);
}

#[tokio::test]
async fn progress_file_round_trips_after_run() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let mut ralph = loop_for(&fixture, one_story_prd());
    let summary = ralph.run().await;
    assert_eq!(summary.stories.completed, 1);

    let path = fixture.work_dir.join(".ralph").join("progress.json");
    let record = ProgressRecord::load(&path).unwrap();
    assert_eq!(record.iteration, 1);
    assert_eq!(record.prd.stories[0].status, StoryStatus::Completed);
    assert_eq!(record.story_attempts["US-001"].len(), 1);
    assert!(record.story_attempts["US-001"][0].success);
}

#[tokio::test]
async fn stop_handle_halts_at_story_boundary() {
    let fixture = fixture(Arc::new(ArtifactLlm));
    let stories = vec![
        UserStory::new("a", "A", "d", vec![], 1),
        UserStory::new("b", "B", "d", vec![], 2),
    ];
    let prd = Prd::new("Stoppable", "d", "feature/stop", stories);
    let mut ralph = loop_for(&fixture, prd);

    // Requested before run: the loop observes it at the first boundary.
    ralph.stop_handle().stop();
    let summary = ralph.run().await;
    assert_eq!(summary.status, "partial");
    assert_eq!(summary.stories.completed, 0);
}
