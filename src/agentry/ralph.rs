//! The Ralph loop: autonomous PRD-driven implementation.
//!
//! One [`RalphLoop`] instance drives one [`Prd`] to completion.  Each
//! iteration it picks the highest-priority eligible story, asks a short-lived
//! code agent to implement it, applies the generated file artifacts, runs
//! the quality gate, logs the attempt to the diary, and, on success,
//! commits, pushes, and reflects.  Failed attempts put the story back in the
//! pool with an incremented attempt counter until its retry budget is
//! exhausted.
//!
//! # Story state machine
//!
//! ```text
//! not_started
//!    └─ pick-up ─► in_progress
//!                      ├─ success path ─► completed   (terminal)
//!                      ├─ retriable fail ─► in_progress  (attempts++)
//!                      └─ attempts == max_retries ─► failed  (terminal)
//! ```
//!
//! Stories whose `dependencies` are not yet completed are skipped for the
//! iteration, not failed; stories blocked only on failed or unknown
//! dependencies are eventually transitioned to `skipped`.
//!
//! # Quality gate
//!
//! The gate runs a configurable sequence of subprocess checks (by default a
//! test runner, a linter, and a type checker, each with a short timeout).
//! In [`QualityGateMode::Soft`] (the default) only *hard* errors (spawn
//! failures unrelated to the checks themselves) fail the attempt; test
//! failures and lint/type warnings are recorded on the attempt but do not
//! block it.  [`QualityGateMode::Strict`] fails the attempt on any failed
//! check.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentry::ralph::{Prd, RalphLoop, UserStory};
//! use agentry::agent_manager::AgentManager;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # async fn run(agents: Arc<AgentManager>) {
//! let prd = Prd::new(
//!     "String tools",
//!     "Small string utilities",
//!     "feature/string-tools",
//!     vec![UserStory::new(
//!         "US-001",
//!         "Reverse a string",
//!         "Implement a function that reverses its input",
//!         vec!["Handles empty input".into()],
//!         1,
//!     )],
//! );
//! let mut ralph = RalphLoop::new(prd, PathBuf::from("."), PathBuf::from("ralph-work"), agents);
//! let summary = ralph.run().await;
//! println!("{}: {}/{} stories", summary.status, summary.stories.completed, summary.stories.total);
//! # }
//! ```

use crate::agentry::agent_manager::{AgentManager, AgentRole, AgentSpec};
use crate::agentry::memory::{AttemptSummary, DiaryEntry, MemoryClient, QualityCheck};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Default cap on loop iterations across all stories.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default retry budget per story.
pub const DEFAULT_MAX_RETRIES_PER_STORY: u32 = 3;

/// Default per-story code-generation timeout.
pub const DEFAULT_STORY_TIMEOUT: Duration = Duration::from_secs(300);

/// Status of a user story within the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::NotStarted => "not_started",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Completed => "completed",
            StoryStatus::Failed => "failed",
            StoryStatus::Skipped => "skipped",
        }
    }

    /// Terminal states are never picked up again by the loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoryStatus::Completed | StoryStatus::Failed | StoryStatus::Skipped)
    }
}

fn default_priority() -> i32 {
    5
}

/// A single unit of work from the PRD.  Lower `priority` = implemented first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commit_ref: Option<String>,
}

impl UserStory {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        acceptance_criteria: Vec<String>,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria,
            priority,
            dependencies: Vec::new(),
            status: StoryStatus::NotStarted,
            attempts: 0,
            last_error: None,
            completed_at: None,
            commit_ref: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Product Requirements Document: a named bundle of prioritized stories on a
/// feature branch.  Immutable in shape after creation; story state mutates
/// as the loop runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "branchName", alias = "branch_name")]
    pub branch_name: String,
    #[serde(default, alias = "userStories")]
    pub stories: Vec<UserStory>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Prd {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        branch_name: impl Into<String>,
        stories: Vec<UserStory>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            branch_name: branch_name.into(),
            stories,
            created_at: Utc::now(),
        }
    }

    /// Parse a PRD from a JSON value, tolerating both `userStories` /
    /// `stories` and camelCase / snake_case story fields.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Non-terminal story indices, sorted by priority ascending with PRD
    /// position breaking ties.
    pub fn eligible_indices(&self) -> Vec<usize> {
        let mut eligible: Vec<usize> = self
            .stories
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(i, _)| i)
            .collect();
        // Stable sort: equal priorities keep original PRD order.
        eligible.sort_by_key(|&i| self.stories[i].priority);
        eligible
    }

    /// A story is runnable only when every dependency id names a completed
    /// story.  Unknown ids block forever.
    pub fn deps_satisfied(&self, idx: usize) -> bool {
        self.stories[idx].dependencies.iter().all(|dep| {
            self.stories
                .iter()
                .any(|s| &s.id == dep && s.status == StoryStatus::Completed)
        })
    }

    /// A story is unrecoverable when some dependency is unknown, failed, or
    /// skipped: it can never become runnable in this loop.
    pub fn deps_unrecoverable(&self, idx: usize) -> bool {
        self.stories[idx].dependencies.iter().any(|dep| {
            match self.stories.iter().find(|s| &s.id == dep) {
                None => true,
                Some(s) => matches!(s.status, StoryStatus::Failed | StoryStatus::Skipped),
            }
        })
    }

    pub fn completed_stories(&self) -> Vec<&UserStory> {
        self.stories
            .iter()
            .filter(|s| s.status == StoryStatus::Completed)
            .collect()
    }

    pub fn failed_stories(&self) -> Vec<&UserStory> {
        self.stories
            .iter()
            .filter(|s| s.status == StoryStatus::Failed)
            .collect()
    }

    /// `100 × completed / total`; zero for an empty PRD.
    pub fn completion_percentage(&self) -> f64 {
        if self.stories.is_empty() {
            return 0.0;
        }
        (self.completed_stories().len() as f64 / self.stories.len() as f64) * 100.0
    }
}

// ── Quality gate ─────────────────────────────────────────────────────────

/// Whether non-hard check failures block an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityGateMode {
    /// Any failed check fails the attempt.
    Strict,
    /// Only hard errors (spawn failures unrelated to check outcomes) fail
    /// the attempt; failed checks are recorded as warnings.  The loop is
    /// biased toward progress; the diary preserves the signal.
    #[default]
    Soft,
}

/// One subprocess check in the gate.
#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CheckSpec {
    pub fn new(name: &str, program: &str, args: &[&str], timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout,
        }
    }
}

/// Aggregated gate result for one attempt.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub checks: Vec<QualityCheck>,
    /// Failures of the gate itself, not of the code under test.
    pub hard_errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateOutcome {
    pub fn passed(&self, mode: QualityGateMode) -> bool {
        match mode {
            QualityGateMode::Soft => self.hard_errors.is_empty(),
            QualityGateMode::Strict => {
                self.hard_errors.is_empty() && self.checks.iter().all(|c| c.passed)
            }
        }
    }
}

/// The configurable check sequence run after each attempt's artifacts are
/// applied.
#[derive(Debug, Clone)]
pub struct QualityGate {
    pub checks: Vec<CheckSpec>,
}

impl Default for QualityGate {
    /// Test runner, linter, type checker: the stack the generated code is
    /// most commonly written against.
    fn default() -> Self {
        Self {
            checks: vec![
                CheckSpec::new("pytest", "pytest", &["-x", "--tb=short"], Duration::from_secs(60)),
                CheckSpec::new("ruff", "ruff", &["check", "."], Duration::from_secs(30)),
                CheckSpec::new(
                    "mypy",
                    "mypy",
                    &["--ignore-missing-imports", "."],
                    Duration::from_secs(60),
                ),
            ],
        }
    }
}

impl QualityGate {
    /// A gate that runs nothing.  Useful in tests and sandboxes without the
    /// toolchain installed.
    pub fn disabled() -> Self {
        Self { checks: Vec::new() }
    }

    /// Run every check in `cwd`.  A missing binary skips its check; a
    /// timeout records a non-blocking warning.
    pub async fn run(&self, cwd: &Path) -> GateOutcome {
        let mut outcome = GateOutcome::default();

        for spec in &self.checks {
            let child = Command::new(&spec.program)
                .args(&spec.args)
                .current_dir(cwd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output();

            match tokio::time::timeout(spec.timeout, child).await {
                Err(_) => {
                    outcome.checks.push(QualityCheck {
                        name: spec.name.clone(),
                        passed: false,
                        output: format!("timed out after {:?}", spec.timeout),
                    });
                    outcome
                        .warnings
                        .push(format!("{} timed out (non-blocking)", spec.name));
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::info!("{} check skipped: not installed", spec.name);
                }
                Ok(Err(e)) => {
                    outcome
                        .hard_errors
                        .push(format!("{} failed to run: {}", spec.name, e));
                }
                Ok(Ok(output)) => {
                    let passed = output.status.success();
                    let text = if !output.stdout.is_empty() {
                        String::from_utf8_lossy(&output.stdout).to_string()
                    } else {
                        String::from_utf8_lossy(&output.stderr).to_string()
                    };
                    let excerpt = crate::agentry::llm_client::truncate(&text, 500);
                    if !passed {
                        outcome
                            .warnings
                            .push(format!("{} reported problems (non-blocking)", spec.name));
                    }
                    outcome.checks.push(QualityCheck {
                        name: spec.name.clone(),
                        passed,
                        output: excerpt,
                    });
                }
            }
        }

        if !outcome.warnings.is_empty() {
            log::info!("quality warnings (non-blocking): {}", outcome.warnings.len());
        }
        outcome
    }
}

// ── Commit driver ────────────────────────────────────────────────────────

/// Black-box interface to the git/push machinery.
#[async_trait]
pub trait CommitDriver: Send + Sync {
    /// Create-or-checkout `branch` in `cwd`.
    async fn checkout_branch(&self, cwd: &Path, branch: &str) -> bool;
    /// Stage everything and commit.  Returns the commit ref on success.
    async fn commit(&self, cwd: &Path, message: &str) -> Option<String>;
    /// Push `branch` to the `origin` remote.
    async fn push(&self, cwd: &Path, branch: &str) -> bool;
}

/// [`CommitDriver`] implemented by shelling out to `git` with standard
/// arguments, with no other assumption about the repository.
pub struct GitCommitDriver;

impl GitCommitDriver {
    async fn git(cwd: &Path, args: &[&str]) -> Option<std::process::Output> {
        match Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) => Some(output),
            Err(e) => {
                log::warn!("git {:?} failed to run: {}", args.first(), e);
                None
            }
        }
    }
}

#[async_trait]
impl CommitDriver for GitCommitDriver {
    async fn checkout_branch(&self, cwd: &Path, branch: &str) -> bool {
        let probe = format!("refs/heads/{}", branch);
        let exists = Self::git(cwd, &["show-ref", "--verify", "--quiet", &probe])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        let result = if exists {
            Self::git(cwd, &["checkout", branch]).await
        } else {
            Self::git(cwd, &["checkout", "-b", branch]).await
        };
        match result {
            Some(output) if output.status.success() => {
                log::info!("checked out branch: {}", branch);
                true
            }
            _ => {
                log::warn!("failed to checkout branch {}", branch);
                false
            }
        }
    }

    async fn commit(&self, cwd: &Path, message: &str) -> Option<String> {
        Self::git(cwd, &["add", "-A"]).await?;
        let committed = Self::git(cwd, &["commit", "-m", message]).await?;
        if !committed.status.success() {
            return None;
        }
        let sha = Self::git(cwd, &["rev-parse", "HEAD"]).await?;
        if sha.status.success() {
            Some(String::from_utf8_lossy(&sha.stdout).trim().to_string())
        } else {
            None
        }
    }

    async fn push(&self, cwd: &Path, branch: &str) -> bool {
        let has_remote = Self::git(cwd, &["remote", "get-url", "origin"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !has_remote {
            log::warn!("no remote 'origin' configured - skipping push");
            return false;
        }

        let push = Command::new("git")
            .args(["push", "-u", "origin", branch])
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        match tokio::time::timeout(Duration::from_secs(30), push).await {
            Err(_) => {
                log::warn!("push timed out after 30 seconds");
                false
            }
            Ok(Err(e)) => {
                log::warn!("push failed to run: {}", e);
                false
            }
            Ok(Ok(output)) => {
                if output.status.success() {
                    log::info!("pushed branch {} to origin", branch);
                    true
                } else {
                    log::warn!(
                        "push failed: {}",
                        crate::agentry::llm_client::truncate(
                            &String::from_utf8_lossy(&output.stderr),
                            200
                        )
                    );
                    false
                }
            }
        }
    }
}

// ── Artifact extraction ──────────────────────────────────────────────────

/// One file extracted from a code agent's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub lang: String,
    /// Relative path under the story's output directory.
    pub path: String,
    pub body: String,
}

lazy_static! {
    // ```lang:relative/path.ext  or  ```lang relative/path.ext
    static ref SHAPE_A: Regex = Regex::new(
        r"(?s)```(\w+)[:\s]+([\w/\.\-]+\.(?:py|rs|js|ts|go|json|toml|yaml|yml|md|txt|html|css|sh))\n(.*?)```"
    )
    .expect("shape-A artifact pattern");
    // Any language-labelled fenced block.
    static ref SHAPE_B: Regex = Regex::new(r"(?s)```(\w+)\n(.*?)```").expect("shape-B artifact pattern");
    static ref PY_DEF: Regex = Regex::new(r"def\s+(\w+)").expect("def pattern");
    static ref PY_CLASS: Regex = Regex::new(r"class\s+(\w+)").expect("class pattern");
    static ref RS_FN: Regex = Regex::new(r"fn\s+(\w+)").expect("fn pattern");
}

fn extension_for(lang: &str) -> &'static str {
    match lang.to_lowercase().as_str() {
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "go" => "go",
        "bash" | "sh" | "shell" => "sh",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yml",
        _ => "txt",
    }
}

/// Infer a filename for an unlabelled code block from the first declaration
/// it contains, falling back to a counter-suffixed default.
fn infer_filename(lang: &str, body: &str, index: usize) -> String {
    let ext = extension_for(lang);
    let stem = if let Some(captures) = PY_DEF.captures(body) {
        captures[1].to_string()
    } else if let Some(captures) = PY_CLASS.captures(body) {
        captures[1].to_lowercase()
    } else if let Some(captures) = RS_FN.captures(body) {
        captures[1].to_string()
    } else {
        "generated_code".to_string()
    };
    if index == 0 {
        format!("{}.{}", stem, ext)
    } else {
        format!("{}_{}.{}", stem, index, ext)
    }
}

/// Parse file artifacts out of a code agent's response.
///
/// Shape A (preferred): fenced blocks labelled `lang:path` (or `lang path`)
/// yielding explicit `(lang, path, body)` triples.  Shape B (fallback when A
/// matches nothing): any language-labelled fenced block, with the path
/// inferred from the first declared function or class name.
pub fn extract_artifacts(code: &str) -> Vec<Artifact> {
    let mut artifacts: Vec<Artifact> = SHAPE_A
        .captures_iter(code)
        .map(|captures| Artifact {
            lang: captures[1].to_string(),
            path: captures[2].to_string(),
            body: captures[3].trim().to_string(),
        })
        .collect();

    if artifacts.is_empty() {
        for (index, captures) in SHAPE_B.captures_iter(code).enumerate() {
            let lang = captures[1].to_string();
            let body = captures[2].trim().to_string();
            if body.is_empty() {
                continue;
            }
            let path = format!("src/{}", infer_filename(&lang, &body, index));
            artifacts.push(Artifact { lang, path, body });
        }
    }

    artifacts
}

// ── Progress persistence ─────────────────────────────────────────────────

/// On-disk snapshot of loop state, overwritten after every iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub prd: Prd,
    pub iteration: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub story_attempts: HashMap<String, Vec<AttemptSummary>>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressRecord {
    /// Atomically overwrite `path` (write-to-temp + rename).
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::other(e.to_string()))
    }
}

// ── Summary ──────────────────────────────────────────────────────────────

/// Story counters for the final summary.
#[derive(Debug, Clone, Serialize)]
pub struct StoryStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub completion_percentage: f64,
}

/// What one `run()` accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct RalphSummary {
    /// `"completed"` when every story finished; `"partial"` otherwise
    /// (failures, skips, or an external stop).
    pub status: String,
    pub iterations: usize,
    pub duration_seconds: f64,
    pub stories: StoryStats,
    pub completed_stories: Vec<UserStory>,
    pub failed_stories: Vec<UserStory>,
    pub total_attempts: usize,
}

/// Cancellation handle returned by [`RalphLoop::stop_handle`].  `stop()`
/// takes effect at the next story boundary.
#[derive(Clone)]
pub struct RalphStopHandle {
    flag: Arc<AtomicBool>,
}

impl RalphStopHandle {
    pub fn stop(&self) {
        log::info!("stopping ralph loop...");
        self.flag.store(true, Ordering::SeqCst);
    }
}

// ── The loop ─────────────────────────────────────────────────────────────

/// Drives one PRD to completion.  See the module docs for the full walk.
pub struct RalphLoop {
    prd: Prd,
    project_root: PathBuf,
    ralph_work_dir: PathBuf,
    agents: Arc<AgentManager>,
    memory: Option<Arc<MemoryClient>>,
    commit_driver: Arc<dyn CommitDriver>,
    max_iterations: usize,
    max_retries_per_story: u32,
    story_timeout: Duration,
    gate: QualityGate,
    gate_mode: QualityGateMode,
    iteration: usize,
    started_at: Option<DateTime<Utc>>,
    story_attempts: HashMap<String, Vec<AttemptSummary>>,
    story_files: HashMap<String, Vec<String>>,
    stop_flag: Arc<AtomicBool>,
}

impl RalphLoop {
    pub fn new(
        prd: Prd,
        project_root: PathBuf,
        ralph_work_dir: PathBuf,
        agents: Arc<AgentManager>,
    ) -> Self {
        log::info!(
            "ralph loop initialized: project={}, work={}, stories={}",
            project_root.display(),
            ralph_work_dir.display(),
            prd.stories.len()
        );
        Self {
            prd,
            project_root,
            ralph_work_dir,
            agents,
            memory: None,
            commit_driver: Arc::new(GitCommitDriver),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_retries_per_story: DEFAULT_MAX_RETRIES_PER_STORY,
            story_timeout: DEFAULT_STORY_TIMEOUT,
            gate: QualityGate::default(),
            gate_mode: QualityGateMode::default(),
            iteration: 0,
            started_at: None,
            story_attempts: HashMap::new(),
            story_files: HashMap::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryClient>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_commit_driver(mut self, driver: Arc<dyn CommitDriver>) -> Self {
        self.commit_driver = driver;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_retries(mut self, max_retries_per_story: u32) -> Self {
        self.max_retries_per_story = max_retries_per_story;
        self
    }

    pub fn with_story_timeout(mut self, timeout: Duration) -> Self {
        self.story_timeout = timeout;
        self
    }

    pub fn with_quality_gate(mut self, gate: QualityGate, mode: QualityGateMode) -> Self {
        self.gate = gate;
        self.gate_mode = mode;
        self
    }

    /// A clonable handle that stops the loop at the next story boundary.
    pub fn stop_handle(&self) -> RalphStopHandle {
        RalphStopHandle {
            flag: Arc::clone(&self.stop_flag),
        }
    }

    /// The PRD in its current state.
    pub fn prd(&self) -> &Prd {
        &self.prd
    }

    fn progress_path(&self) -> PathBuf {
        self.ralph_work_dir.join(".ralph").join("progress.json")
    }

    fn save_progress(&self) {
        let record = ProgressRecord {
            prd: self.prd.clone(),
            iteration: self.iteration,
            started_at: self.started_at,
            story_attempts: self.story_attempts.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = record.save(&self.progress_path()) {
            log::warn!("failed to save progress: {}", e);
        }
    }

    /// Execute the loop until every story is terminal, the iteration cap is
    /// hit, or `stop()` is requested.
    pub async fn run(&mut self) -> RalphSummary {
        if self.prd.stories.is_empty() {
            log::info!("empty PRD, nothing to do");
            return self.summary(false);
        }

        self.started_at = Some(Utc::now());
        self.commit_driver
            .checkout_branch(&self.project_root, &self.prd.branch_name)
            .await;
        self.save_progress();

        log::info!(
            "starting ralph loop: {} stories, max_iterations={}",
            self.prd.stories.len(),
            self.max_iterations
        );

        let mut stopped = false;
        while self.iteration < self.max_iterations {
            if self.stop_flag.load(Ordering::SeqCst) {
                stopped = true;
                break;
            }

            let eligible = self.prd.eligible_indices();
            if eligible.is_empty() {
                log::info!("all stories settled after {} iterations", self.iteration);
                break;
            }

            let Some(&idx) = eligible.iter().find(|&&i| self.prd.deps_satisfied(i)) else {
                // Everything runnable is blocked.  Stories whose deps are
                // failed or unknown can never run; skip them.
                let mut transitioned = false;
                for &i in &eligible {
                    if self.prd.deps_unrecoverable(i) {
                        log::warn!(
                            "story {} blocked on failed/unknown dependencies, skipping",
                            self.prd.stories[i].id
                        );
                        self.prd.stories[i].status = StoryStatus::Skipped;
                        transitioned = true;
                    }
                }
                if !transitioned {
                    // Dependency cycle; nothing will ever become runnable.
                    for &i in &eligible {
                        log::warn!(
                            "story {} is part of a dependency cycle, skipping",
                            self.prd.stories[i].id
                        );
                        self.prd.stories[i].status = StoryStatus::Skipped;
                    }
                }
                self.save_progress();
                continue;
            };

            if self.prd.stories[idx].attempts >= self.max_retries_per_story {
                let (story_id, title, attempts) = {
                    let story = &mut self.prd.stories[idx];
                    log::warn!("story {} exceeded max retries, marking as failed", story.id);
                    story.status = StoryStatus::Failed;
                    (story.id.clone(), story.title.clone(), story.attempts)
                };
                self.reflect_on_story(&story_id, &title, attempts, false, None).await;
                self.save_progress();
                continue;
            }

            self.iteration += 1;
            self.prd.stories[idx].status = StoryStatus::InProgress;
            self.prd.stories[idx].attempts += 1;
            let story = self.prd.stories[idx].clone();
            log::info!(
                "iteration {}: implementing story {} (attempt {})",
                self.iteration,
                story.id,
                story.attempts
            );

            let attempt = self.attempt_story(&story).await;

            self.write_diary(&story, &attempt).await;
            self.story_files
                .entry(story.id.clone())
                .or_default()
                .extend(attempt.files.iter().cloned());
            self.story_attempts
                .entry(story.id.clone())
                .or_default()
                .push(AttemptSummary {
                    attempt: story.attempts,
                    success: attempt.error.is_none(),
                    changes_made: attempt.changes_made,
                    error: attempt.error.clone(),
                    quality_checks: attempt.quality_checks.clone(),
                });

            if attempt.error.is_none() {
                let commit_ref = self.commit_story(&story).await;
                {
                    let record = &mut self.prd.stories[idx];
                    record.status = StoryStatus::Completed;
                    record.completed_at = Some(Utc::now());
                    record.commit_ref = commit_ref.clone();
                    record.last_error = None;
                }
                log::info!("completed story {}: {}", story.id, story.title);
                self.reflect_on_story(&story.id, &story.title, story.attempts, true, commit_ref.as_deref())
                    .await;
            } else {
                let error = attempt.error.clone().unwrap_or_default();
                log::warn!("failed story {} attempt {}: {}", story.id, story.attempts, error);
                self.prd.stories[idx].last_error = Some(error);
            }

            self.save_progress();
        }

        // Every story must land in a terminal state before summarising: an
        // exhausted retry budget is a failure, anything else left behind by
        // the iteration cap is skipped.  A stopped loop leaves stories as
        // they are.
        if !stopped {
            for i in self.prd.eligible_indices() {
                if self.prd.stories[i].attempts >= self.max_retries_per_story {
                    let (story_id, title, attempts) = {
                        let story = &mut self.prd.stories[i];
                        story.status = StoryStatus::Failed;
                        (story.id.clone(), story.title.clone(), story.attempts)
                    };
                    self.reflect_on_story(&story_id, &title, attempts, false, None).await;
                } else {
                    log::warn!(
                        "iteration cap reached with story {} unfinished, skipping",
                        self.prd.stories[i].id
                    );
                    self.prd.stories[i].status = StoryStatus::Skipped;
                }
            }
        }

        if stopped {
            // Best effort: a clean tree commits, a dirty one is left as-is.
            self.commit_driver
                .commit(&self.ralph_work_dir, "chore: partial progress before stop")
                .await;
        }

        self.save_progress();
        self.summary(stopped)
    }

    /// One full attempt: delegate to a fresh code agent, apply artifacts,
    /// run the gate.  Errors are carried in the returned record.
    async fn attempt_story(&self, story: &UserStory) -> AttemptOutcome {
        let mut outcome = AttemptOutcome::default();

        let learnings = self.query_learnings(story).await;
        let prompt = build_implementation_prompt(story, &learnings);

        let agent_name = format!("CodeAgent-{}-{}", story.id, Utc::now().timestamp_millis());
        let spec = AgentSpec::new(&agent_name, AgentRole::Code).with_parent("ralph-loop");
        let agent = match self.agents.create_agent(spec).await {
            Ok(agent) => agent,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        // The loop composed its own learnings section; no double injection.
        let result = self
            .agents
            .execute_task(&agent.id, &prompt, self.story_timeout, false)
            .await;
        self.agents.terminate_agent(&agent.id).await;

        if let Some(error) = result.error {
            outcome.error = Some(error);
            return outcome;
        }
        let code = result.output.unwrap_or_default();
        outcome.code_excerpt = Some(code.clone());

        match self.apply_code_changes(&code, story) {
            Ok(files) => {
                outcome.changes_made = files.len();
                outcome.files = files;
            }
            Err(e) => {
                outcome.error = Some(format!("failed to apply changes: {}", e));
                return outcome;
            }
        }
        if outcome.changes_made == 0 {
            outcome.error = Some("No code changes applied".to_string());
            return outcome;
        }

        let gate = self.gate.run(&self.project_root).await;
        outcome.quality_checks = gate.checks.clone();
        if !gate.passed(self.gate_mode) {
            let detail = if gate.hard_errors.is_empty() {
                gate.checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                gate.hard_errors.join("; ")
            };
            outcome.error = Some(format!("Quality checks failed: {}", detail));
        }

        outcome
    }

    async fn query_learnings(&self, story: &UserStory) -> Vec<crate::agentry::memory::Learning> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        let query = format!(
            "{} {} {}",
            story.title,
            story.description,
            story.acceptance_criteria.join(" ")
        );
        let learnings = memory
            .query_past_learnings(&query, &["ralph", "code_implementation"], 5, 0.6)
            .await;
        log::info!("found {} past learnings for story {}", learnings.len(), story.id);
        learnings
    }

    /// Write extracted artifacts under `generated/{story_id}/…`, creating
    /// parent directories as needed.  Returns the relative paths written.
    fn apply_code_changes(&self, code: &str, story: &UserStory) -> std::io::Result<Vec<String>> {
        let artifacts = extract_artifacts(code);
        let story_dir = self.ralph_work_dir.join("generated").join(&story.id);

        let mut written = Vec::new();
        for artifact in artifacts {
            // Relative paths only; reject traversal.
            if artifact.path.contains("..") || artifact.path.starts_with('/') {
                log::warn!("refusing artifact path {}", artifact.path);
                continue;
            }
            let target = story_dir.join(&artifact.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &artifact.body)?;
            log::info!("applied artifact: {}/{}", story.id, artifact.path);
            written.push(artifact.path);
        }
        Ok(written)
    }

    async fn write_diary(&self, story: &UserStory, attempt: &AttemptOutcome) {
        let Some(memory) = &self.memory else {
            return;
        };
        let mut entry = DiaryEntry::new(&story.id, &story.title, story.attempts, attempt.error.is_none())
            .with_changes(attempt.changes_made)
            .with_quality_checks(attempt.quality_checks.clone())
            .with_files(attempt.files.clone());
        if let Some(code) = &attempt.code_excerpt {
            entry = entry.with_code_excerpt(code);
        }
        if let Some(error) = &attempt.error {
            entry = entry.with_error(error.clone());
        }
        if let Err(e) = memory.diary(entry).await {
            log::warn!("failed to write diary entry: {}", e);
        }
    }

    async fn reflect_on_story(
        &self,
        story_id: &str,
        title: &str,
        total_attempts: u32,
        final_success: bool,
        commit_ref: Option<&str>,
    ) {
        let Some(memory) = &self.memory else {
            return;
        };
        let attempts = self.story_attempts.get(story_id).cloned().unwrap_or_default();
        let files = self.story_files.get(story_id).cloned().unwrap_or_default();
        if let Err(e) = memory
            .reflect(story_id, title, total_attempts, final_success, &attempts, &files, commit_ref)
            .await
        {
            log::warn!("failed to reflect on story {}: {}", story_id, e);
        }
    }

    async fn commit_story(&self, story: &UserStory) -> Option<String> {
        let message = format!(
            "feat({}): {}\n\nImplemented by Ralph autonomous loop.",
            story.id, story.title
        );
        let commit_ref = self.commit_driver.commit(&self.ralph_work_dir, &message).await;
        if commit_ref.is_some() {
            self.commit_driver
                .push(&self.ralph_work_dir, &self.prd.branch_name)
                .await;
        }
        commit_ref
    }

    fn summary(&self, stopped: bool) -> RalphSummary {
        let completed: Vec<UserStory> = self.prd.completed_stories().into_iter().cloned().collect();
        let failed: Vec<UserStory> = self.prd.failed_stories().into_iter().cloned().collect();
        let duration_seconds = self
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        // Anything short of every story completing (failures, skips, the
        // iteration cap, an external stop) is a partial run.
        let status = if stopped || completed.len() != self.prd.stories.len() {
            "partial"
        } else {
            "completed"
        };

        RalphSummary {
            status: status.to_string(),
            iterations: self.iteration,
            duration_seconds,
            stories: StoryStats {
                total: self.prd.stories.len(),
                completed: completed.len(),
                failed: failed.len(),
                completion_percentage: self.prd.completion_percentage(),
            },
            completed_stories: completed,
            failed_stories: failed,
            total_attempts: self.story_attempts.values().map(|a| a.len()).sum(),
        }
    }
}

/// Working state of one attempt, folded into diary entries and summaries.
#[derive(Debug, Clone, Default)]
struct AttemptOutcome {
    changes_made: usize,
    files: Vec<String>,
    code_excerpt: Option<String>,
    error: Option<String>,
    quality_checks: Vec<QualityCheck>,
}

/// Compose the code-generation prompt for one story.
fn build_implementation_prompt(
    story: &UserStory,
    learnings: &[crate::agentry::memory::Learning],
) -> String {
    let mut parts = vec![
        format!("# User Story: {}", story.title),
        String::new(),
        "## Description".to_string(),
        story.description.clone(),
        String::new(),
        "## Acceptance Criteria".to_string(),
    ];
    for (i, criterion) in story.acceptance_criteria.iter().enumerate() {
        parts.push(format!("{}. {}", i + 1, criterion));
    }

    parts.push(String::new());
    parts.push("## Implementation Requirements".to_string());
    parts.push("- Write clean, production-ready code".to_string());
    parts.push("- Follow existing code conventions in the project".to_string());
    parts.push("- Include appropriate error handling".to_string());
    parts.push("- Add documentation and comments where needed".to_string());
    parts.push(
        "- Emit every file as a fenced code block labelled `language:relative/path`".to_string(),
    );

    if !learnings.is_empty() {
        parts.push(String::new());
        parts.push("## Learnings from Similar Past Tasks".to_string());
        for learning in learnings.iter().take(3) {
            let line = learning
                .insights
                .first()
                .cloned()
                .unwrap_or_else(|| crate::agentry::llm_client::truncate(&learning.content, 200));
            parts.push(format!("- {}", line));
        }
    }

    if story.attempts > 1 {
        parts.push(String::new());
        parts.push("## Previous Attempt Failed".to_string());
        parts.push(format!(
            "Error: {}",
            story.last_error.as_deref().unwrap_or("unknown")
        ));
        parts.push("Please address this issue in your implementation.".to_string());
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, priority: i32) -> UserStory {
        UserStory::new(id, format!("Story {}", id), "desc", vec![], priority)
    }

    #[test]
    fn next_story_ordering_prefers_priority_then_position() {
        let mut prd = Prd::new("p", "d", "feature/x", vec![story("a", 3), story("b", 1), story("c", 1)]);
        let eligible = prd.eligible_indices();
        assert_eq!(eligible, vec![1, 2, 0]);

        prd.stories[1].status = StoryStatus::Completed;
        let eligible = prd.eligible_indices();
        assert_eq!(eligible, vec![2, 0]);
    }

    #[test]
    fn unknown_dependency_blocks_forever() {
        let blocked = story("a", 1).with_dependencies(vec!["missing".to_string()]);
        let prd = Prd::new("p", "d", "feature/x", vec![blocked]);
        assert!(!prd.deps_satisfied(0));
        assert!(prd.deps_unrecoverable(0));
    }

    #[test]
    fn dependency_satisfied_only_when_completed() {
        let mut prd = Prd::new(
            "p",
            "d",
            "feature/x",
            vec![story("base", 1), story("top", 2).with_dependencies(vec!["base".to_string()])],
        );
        assert!(!prd.deps_satisfied(1));
        prd.stories[0].status = StoryStatus::Completed;
        assert!(prd.deps_satisfied(1));
    }

    #[test]
    fn completion_percentage_matches_definition() {
        let mut prd = Prd::new("p", "d", "feature/x", vec![story("a", 1), story("b", 1)]);
        assert_eq!(prd.completion_percentage(), 0.0);
        prd.stories[0].status = StoryStatus::Completed;
        assert_eq!(prd.completion_percentage(), 50.0);

        let empty = Prd::new("p", "d", "feature/x", vec![]);
        assert_eq!(empty.completion_percentage(), 0.0);
    }

    #[test]
    fn shape_a_artifacts_take_precedence() {
        let code = "Here you go:\n```python:src/tools/reverse.py\ndef reverse(s):\n    return s[::-1]\n```\n";
        let artifacts = extract_artifacts(code);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, "src/tools/reverse.py");
        assert_eq!(artifacts[0].lang, "python");
        assert!(artifacts[0].body.contains("def reverse"));
    }

    #[test]
    fn shape_b_infers_filename_from_declaration() {
        let code = "```python\ndef reverse_string(s):\n    return s[::-1]\n```";
        let artifacts = extract_artifacts(code);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, "src/reverse_string.py");
    }

    #[test]
    fn shape_b_counter_suffix_for_later_blocks() {
        let code = "```python\nx = 1\n```\n\n```python\ny = 2\n```";
        let artifacts = extract_artifacts(code);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].path, "src/generated_code.py");
        assert_eq!(artifacts[1].path, "src/generated_code_1.py");
    }

    #[test]
    fn no_artifacts_in_plain_prose() {
        assert!(extract_artifacts("I would approach this by...").is_empty());
    }

    #[test]
    fn prompt_includes_retry_section_after_first_attempt() {
        let mut s = story("a", 1);
        s.acceptance_criteria = vec!["does the thing".to_string()];
        let first = build_implementation_prompt(&s, &[]);
        assert!(first.contains("## Acceptance Criteria"));
        assert!(first.contains("1. does the thing"));
        assert!(!first.contains("## Previous Attempt Failed"));

        s.attempts = 2;
        s.last_error = Some("No code changes applied".to_string());
        let retry = build_implementation_prompt(&s, &[]);
        assert!(retry.contains("## Previous Attempt Failed"));
        assert!(retry.contains("No code changes applied"));
    }

    #[test]
    fn prd_parses_camel_case_wire_shape() {
        let value = serde_json::json!({
            "name": "Calc",
            "description": "A calculator",
            "branchName": "feature/calc",
            "userStories": [{
                "id": "US-001",
                "title": "Add",
                "description": "Adds numbers",
                "acceptanceCriteria": ["1+1=2"],
                "priority": 1
            }]
        });
        let prd = Prd::from_value(value).unwrap();
        assert_eq!(prd.branch_name, "feature/calc");
        assert_eq!(prd.stories.len(), 1);
        assert_eq!(prd.stories[0].acceptance_criteria, vec!["1+1=2"]);
        assert_eq!(prd.stories[0].status, StoryStatus::NotStarted);
    }

    #[test]
    fn progress_record_round_trips() {
        let dir = std::env::temp_dir().join(format!("ralph-progress-{}", std::process::id()));
        let path = dir.join(".ralph").join("progress.json");
        let record = ProgressRecord {
            prd: Prd::new("p", "d", "feature/x", vec![story("a", 1)]),
            iteration: 2,
            started_at: Some(Utc::now()),
            story_attempts: HashMap::from([(
                "a".to_string(),
                vec![AttemptSummary {
                    attempt: 1,
                    success: false,
                    changes_made: 0,
                    error: Some("No code changes applied".to_string()),
                    quality_checks: vec![],
                }],
            )]),
            timestamp: Utc::now(),
        };
        record.save(&path).unwrap();
        let loaded = ProgressRecord::load(&path).unwrap();
        assert_eq!(loaded.iteration, 2);
        assert_eq!(loaded.prd.stories[0].id, "a");
        assert_eq!(loaded.story_attempts["a"].len(), 1);
        let _ = fs::remove_dir_all(dir);
    }
}
