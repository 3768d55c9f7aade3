//! Diary / reflection learning memory.
//!
//! Every attempt the system makes at a story is logged as a [`DiaryEntry`];
//! every finished story is distilled into a [`Reflection`] whose failure
//! patterns, success factors, insights, and recommendations are derived
//! *deterministically* from the attempt log.  Both are written twice:
//!
//! 1. **Locally**, as human-readable markdown under
//!    `{workspace_root}/.copilot/memory/`; this write must succeed.
//! 2. **Remotely**, as `research_snippet` artifacts committed to the memory
//!    service for vector search; remote failures are logged, never
//!    propagated.
//!
//! Before a new attempt, [`MemoryClient::query_past_learnings`] retrieves
//! semantically similar prior records so the next prompt can be biased away
//! from past failure modes.  When both a diary entry and a reflection match
//! at equal similarity, the reflection wins.
//!
//! # Disk layout
//!
//! ```text
//! {workspace_root}/.copilot/memory/
//!   COPILOT.md                            # master learnings file, append-only
//!   diary/{YYYY-MM-DD}-{story}-{attempt}.md
//!   reflections/{YYYY-MM-DD}-{story}.md
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timeout for ancillary (memory service) HTTP calls.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Derived recommendation lists are capped at this many entries.
const MAX_RECOMMENDATIONS: usize = 5;

/// Outcome of one quality-gate check, as recorded on attempts and diary
/// entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name (`"pytest"`, `"ruff"`, `"mypy"`, ...).
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Excerpt of the check's output.
    pub output: String,
}

/// Compact record of one attempt, used as reflection input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    /// 1-based attempt number.
    pub attempt: u32,
    pub success: bool,
    /// Number of files the attempt wrote.
    pub changes_made: usize,
    pub error: Option<String>,
    #[serde(default)]
    pub quality_checks: Vec<QualityCheck>,
}

/// An append-only record of one task attempt.  Never mutated after creation;
/// exactly one exists per attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DiaryEntry {
    pub id: String,
    pub story_id: String,
    pub story_title: String,
    pub attempt_number: u32,
    pub success: bool,
    pub changes_made: usize,
    /// Truncated excerpt of the generated code, when any.
    pub code_excerpt: Option<String>,
    pub error: Option<String>,
    pub quality_checks: Vec<QualityCheck>,
    pub files_touched: Vec<String>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DiaryEntry {
    /// Start a diary entry for one attempt.  Optional fields are attached
    /// with the `with_*` builders.
    pub fn new(
        story_id: impl Into<String>,
        story_title: impl Into<String>,
        attempt_number: u32,
        success: bool,
    ) -> Self {
        let story_id = story_id.into();
        let id = format!(
            "diary-{}-{}-{}",
            story_id,
            attempt_number,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            id,
            story_id,
            story_title: story_title.into(),
            attempt_number,
            success,
            changes_made: 0,
            code_excerpt: None,
            error: None,
            quality_checks: Vec::new(),
            files_touched: Vec::new(),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_changes(mut self, changes_made: usize) -> Self {
        self.changes_made = changes_made;
        self
    }

    /// Attach a code excerpt, truncated to 500 characters.
    pub fn with_code_excerpt(mut self, code: &str) -> Self {
        self.code_excerpt = Some(crate::agentry::llm_client::truncate(code, 500));
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_quality_checks(mut self, checks: Vec<QualityCheck>) -> Self {
        self.quality_checks = checks;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_touched = files;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Render the entry for the human-readable diary folder.
    pub fn to_markdown(&self) -> String {
        let status = if self.success { "✅ Success" } else { "❌ Failed" };
        let mut md = format!(
            "## Diary Entry: {}\n\
             **Date:** {}\n\
             **Story ID:** {}\n\
             **Attempt:** #{}\n\
             **Status:** {}\n\
             **Changes Made:** {} files\n\n",
            self.story_title,
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.story_id,
            self.attempt_number,
            status,
            self.changes_made
        );

        if let Some(error) = &self.error {
            md.push_str(&format!("### Error\n```\n{}\n```\n\n", error));
        }

        if !self.files_touched.is_empty() {
            md.push_str("### Files Modified\n");
            for file in &self.files_touched {
                md.push_str(&format!("- {}\n", file));
            }
            md.push('\n');
        }

        if !self.quality_checks.is_empty() {
            md.push_str("### Quality Checks\n");
            for check in &self.quality_checks {
                let emoji = if check.passed { "✅" } else { "❌" };
                md.push_str(&format!("- {} {}\n", emoji, check.name));
            }
            md.push('\n');
        }

        md
    }
}

/// The distilled learnings from one completed (or abandoned) story.
/// Produced at most once per story completion.
#[derive(Debug, Clone, Serialize)]
pub struct Reflection {
    pub id: String,
    pub story_id: String,
    pub story_title: String,
    pub total_attempts: u32,
    pub final_success: bool,
    pub failure_patterns: Vec<String>,
    pub success_factors: Vec<String>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub files_touched: Vec<String>,
    pub commit_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Reflection {
    /// Render the reflection for the reflections folder and `COPILOT.md`.
    pub fn to_markdown(&self) -> String {
        let status = if self.final_success {
            "✅ Completed"
        } else {
            "❌ Failed"
        };
        let mut md = format!(
            "## Reflection: {}\n\
             **Date:** {}\n\
             **Status:** {}\n\
             **Total Attempts:** {}\n\
             **Commit:** {}\n\n",
            self.story_title,
            self.timestamp.format("%Y-%m-%d %H:%M"),
            status,
            self.total_attempts,
            self.commit_ref.as_deref().unwrap_or("N/A"),
        );

        for (heading, items) in [
            ("### Key Insights\n", &self.insights),
            ("### What Worked\n", &self.success_factors),
            ("### Failure Patterns\n", &self.failure_patterns),
            ("### Recommendations\n", &self.recommendations),
        ] {
            if !items.is_empty() {
                md.push_str(heading);
                for item in items {
                    md.push_str(&format!("- {}\n", item));
                }
                md.push('\n');
            }
        }

        md
    }
}

/// One retrieved past learning.
#[derive(Debug, Clone)]
pub struct Learning {
    /// The embedded text of the record.
    pub content: String,
    /// `"reflection"`, `"diary"`, or `"local_memory"`.
    pub kind: String,
    /// Similarity score reported by the memory service (`0.0..=1.0`).
    pub score: f32,
    pub story_id: Option<String>,
    pub story_title: Option<String>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    content: String,
    #[serde(default)]
    artifact_content: String,
    #[serde(default)]
    score: f32,
}

/// Client for the diary/reflect learning system.
///
/// Writes locally under `{workspace_root}/.copilot/memory/` and mirrors to
/// the remote memory service.  Safe to share via `Arc`.
pub struct MemoryClient {
    service_url: String,
    http: reqwest::Client,
    actor_id: String,
    session_id: String,
    diary_dir: PathBuf,
    reflections_dir: PathBuf,
    notes_file: PathBuf,
}

impl MemoryClient {
    /// Create a client rooted at `workspace_root`, bootstrapping the memory
    /// directory tree and the `COPILOT.md` header if missing.
    pub fn new(service_url: impl Into<String>, workspace_root: &Path) -> io::Result<Self> {
        let memory_dir = workspace_root.join(".copilot").join("memory");
        let diary_dir = memory_dir.join("diary");
        let reflections_dir = memory_dir.join("reflections");
        fs::create_dir_all(&diary_dir)?;
        fs::create_dir_all(&reflections_dir)?;

        let notes_file = memory_dir.join("COPILOT.md");
        if !notes_file.exists() {
            fs::write(
                &notes_file,
                "# Copilot Memory\n\n\
                 This file contains learnings extracted from coding sessions.\n\
                 The assistant uses this to improve future task implementations.\n\n\
                 ## Learnings\n\n",
            )?;
        }

        let http = reqwest::Client::builder()
            .timeout(SERVICE_TIMEOUT)
            .build()
            .unwrap_or_default();

        log::info!("memory client initialized at {}", memory_dir.display());

        Ok(Self {
            service_url: service_url.into().trim_end_matches('/').to_string(),
            http,
            actor_id: "ralph-autonomous-loop".to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            diary_dir,
            reflections_dir,
            notes_file,
        })
    }

    /// Log a task attempt.  The local markdown write must succeed; the
    /// remote commit is best-effort.  Returns the diary entry id.
    pub async fn diary(&self, entry: DiaryEntry) -> io::Result<String> {
        let filename = format!(
            "{}-{}-{}.md",
            entry.timestamp.format("%Y-%m-%d"),
            entry.story_id,
            entry.attempt_number
        );
        fs::write(self.diary_dir.join(filename), entry.to_markdown())?;

        if let Err(e) = self.commit_diary_remote(&entry).await {
            log::warn!("failed to commit diary entry to memory service: {}", e);
        }

        log::info!("diary entry saved: {}", entry.id);
        Ok(entry.id)
    }

    async fn commit_diary_remote(&self, entry: &DiaryEntry) -> Result<(), reqwest::Error> {
        let mut text = format!(
            "Task: {}\nAttempt: #{}\nSuccess: {}\nChanges: {} files\n",
            entry.story_title, entry.attempt_number, entry.success, entry.changes_made
        );
        if let Some(error) = &entry.error {
            text.push_str(&format!("Error: {}\n", error));
        }
        if !entry.files_touched.is_empty() {
            text.push_str(&format!("Files: {}\n", entry.files_touched.join(", ")));
        }

        let outcome_tag = if entry.success { "success" } else { "failure" };
        let body = serde_json::json!({
            "artifact": {
                "artifact_type": "research_snippet",
                "content": {
                    "text": text,
                    "diary_data": entry,
                    "story_id": entry.story_id,
                    "story_title": entry.story_title,
                    "attempt": entry.attempt_number,
                    "success": entry.success,
                },
                "created_by": self.actor_id,
                "session_id": self.session_id,
                "tags": ["ralph", "diary", entry.story_id, outcome_tag],
                "metadata": {
                    "story_id": entry.story_id,
                    "attempt": entry.attempt_number,
                    "success": entry.success,
                    "timestamp": entry.timestamp.to_rfc3339(),
                },
            },
            "actor_id": self.actor_id,
            "actor_type": "autonomous_loop",
            "tool_ids": ["ralph_loop", "code_generation"],
            "generate_embedding": true,
            "store_in_cold": false,
        });

        self.http
            .post(format!("{}/memory/commit", self.service_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Distil a finished story's attempt log into a [`Reflection`].
    ///
    /// The derivations are pure functions of `all_attempts`: calling this
    /// twice with the same input yields byte-identical pattern, factor, and
    /// recommendation lists.  Writes the reflection file, appends a summary
    /// section to `COPILOT.md`, and commits the reflection remotely
    /// (best-effort, stored long-term).
    #[allow(clippy::too_many_arguments)]
    pub async fn reflect(
        &self,
        story_id: &str,
        story_title: &str,
        total_attempts: u32,
        final_success: bool,
        all_attempts: &[AttemptSummary],
        files_touched: &[String],
        commit_ref: Option<&str>,
    ) -> io::Result<Reflection> {
        let failures: Vec<&AttemptSummary> = all_attempts.iter().filter(|a| !a.success).collect();
        let successes: Vec<&AttemptSummary> = all_attempts.iter().filter(|a| a.success).collect();

        let failure_patterns = analyze_failure_patterns(&failures);
        let success_factors = analyze_success_factors(&successes, &failures);
        let insights = generate_insights(
            story_title,
            total_attempts,
            final_success,
            &failure_patterns,
            &success_factors,
        );
        let recommendations = generate_recommendations(&failure_patterns, &success_factors);

        let reflection = Reflection {
            id: format!(
                "reflect-{}-{}",
                story_id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            story_id: story_id.to_string(),
            story_title: story_title.to_string(),
            total_attempts,
            final_success,
            failure_patterns,
            success_factors,
            insights,
            recommendations,
            files_touched: files_touched.to_vec(),
            commit_ref: commit_ref.map(|s| s.to_string()),
            timestamp: Utc::now(),
        };

        let filename = format!("{}-{}.md", reflection.timestamp.format("%Y-%m-%d"), story_id);
        fs::write(self.reflections_dir.join(filename), reflection.to_markdown())?;

        self.append_to_notes(&reflection)?;

        if let Err(e) = self.commit_reflection_remote(&reflection).await {
            log::warn!("failed to commit reflection to memory service: {}", e);
        }

        log::info!("reflection completed: {}", reflection.id);
        Ok(reflection)
    }

    /// Append the short reflection summary to the master learnings file.
    fn append_to_notes(&self, reflection: &Reflection) -> io::Result<()> {
        let status = if reflection.final_success {
            "✅ Success"
        } else {
            "❌ Failed"
        };
        let mut section = format!(
            "\n### {}\n*{}* | Attempts: {} | {}\n\n",
            reflection.story_title,
            reflection.timestamp.format("%Y-%m-%d"),
            reflection.total_attempts,
            status
        );
        for insight in reflection.insights.iter().take(3) {
            section.push_str(&format!("- {}\n", insight));
        }
        if !reflection.recommendations.is_empty() {
            section.push_str("\n**Recommendations:**\n");
            for rec in reflection.recommendations.iter().take(2) {
                section.push_str(&format!("- {}\n", rec));
            }
        }
        section.push_str("\n---\n");

        let mut content = fs::read_to_string(&self.notes_file).unwrap_or_default();
        content.push_str(&section);
        fs::write(&self.notes_file, content)
    }

    async fn commit_reflection_remote(&self, reflection: &Reflection) -> Result<(), reqwest::Error> {
        let text = format!(
            "Reflection: {}\nAttempts: {}\nSuccess: {}\n\nInsights:\n{}\n\nRecommendations:\n{}\n",
            reflection.story_title,
            reflection.total_attempts,
            reflection.final_success,
            reflection
                .insights
                .iter()
                .map(|i| format!("- {}", i))
                .collect::<Vec<_>>()
                .join("\n"),
            reflection
                .recommendations
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let body = serde_json::json!({
            "artifact": {
                "artifact_type": "research_snippet",
                "content": {
                    "text": text,
                    "reflection_data": reflection,
                    "story_id": reflection.story_id,
                    "story_title": reflection.story_title,
                    "insights": reflection.insights,
                    "recommendations": reflection.recommendations,
                },
                "created_by": self.actor_id,
                "session_id": self.session_id,
                "tags": ["ralph", "reflection", reflection.story_id, "learning"],
                "metadata": {
                    "story_id": reflection.story_id,
                    "total_attempts": reflection.total_attempts,
                    "final_success": reflection.final_success,
                    "timestamp": reflection.timestamp.to_rfc3339(),
                },
            },
            "actor_id": self.actor_id,
            "actor_type": "autonomous_loop",
            "tool_ids": ["ralph_loop", "reflection"],
            "generate_embedding": true,
            "store_in_cold": true,
        });

        self.http
            .post(format!("{}/memory/commit", self.service_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Retrieve past learnings semantically similar to `query`.
    ///
    /// Returns at most `limit` records above `min_similarity`, best first;
    /// on score ties reflections are preferred over diary entries.  An
    /// unreachable memory service yields an empty list (plus a warning);
    /// learning retrieval must never block progress.  When the remote
    /// returns fewer than `limit` records, the tail of `COPILOT.md` is
    /// appended as a low-score local fallback.
    pub async fn query_past_learnings(
        &self,
        query: &str,
        _tags: &[&str],
        limit: usize,
        min_similarity: f32,
    ) -> Vec<Learning> {
        let mut learnings = Vec::new();

        let body = serde_json::json!({
            "query_text": query,
            "top_k": limit,
            "filter_artifact_type": "research_snippet",
            "min_similarity": min_similarity,
        });

        let response = self
            .http
            .post(format!("{}/memory/query", self.service_url))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<QueryResponse>().await {
                Ok(parsed) => {
                    for result in parsed.results {
                        learnings.push(parse_learning(result));
                    }
                }
                Err(e) => log::warn!("memory query returned malformed body: {}", e),
            },
            Ok(resp) => log::warn!("memory service returned {}", resp.status()),
            Err(e) => log::warn!("failed to query memory service: {}", e),
        }

        // Reflections carry distilled insight; prefer them on score ties.
        learnings.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let rank = |l: &Learning| if l.kind == "reflection" { 0 } else { 1 };
                    rank(a).cmp(&rank(b))
                })
        });
        learnings.truncate(limit);

        if learnings.len() < limit {
            if let Ok(content) = fs::read_to_string(&self.notes_file) {
                if !content.trim().is_empty() {
                    let tail: String = {
                        let chars: Vec<char> = content.chars().collect();
                        let start = chars.len().saturating_sub(2000);
                        chars[start..].iter().collect()
                    };
                    learnings.push(Learning {
                        content: tail,
                        kind: "local_memory".to_string(),
                        score: 0.5,
                        story_id: None,
                        story_title: None,
                        insights: Vec::new(),
                        recommendations: Vec::new(),
                    });
                }
            }
        }

        log::info!("found {} past learnings for query", learnings.len());
        learnings
    }

    /// Read back local diary markdown files, newest first, optionally
    /// filtered by story id.
    pub fn diary_entries(&self, story_id: Option<&str>, limit: usize) -> Vec<(String, String)> {
        read_markdown_dir(&self.diary_dir, story_id, limit)
    }

    /// Read back local reflection markdown files, newest first, optionally
    /// filtered by story id.
    pub fn reflections(&self, story_id: Option<&str>, limit: usize) -> Vec<(String, String)> {
        read_markdown_dir(&self.reflections_dir, story_id, limit)
    }
}

fn read_markdown_dir(dir: &Path, story_id: Option<&str>, limit: usize) -> Vec<(String, String)> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".md"))
            .collect(),
        Err(_) => return Vec::new(),
    };
    names.sort();
    names.reverse();

    let mut out = Vec::new();
    for name in names {
        if out.len() >= limit {
            break;
        }
        if let Some(story) = story_id {
            if !name.contains(story) {
                continue;
            }
        }
        if let Ok(content) = fs::read_to_string(dir.join(&name)) {
            out.push((name, content));
        }
    }
    out
}

fn parse_learning(result: QueryResult) -> Learning {
    let artifact: serde_json::Value =
        serde_json::from_str(&result.artifact_content).unwrap_or(serde_json::Value::Null);
    let kind = if artifact.get("reflection_data").is_some() {
        "reflection"
    } else {
        "diary"
    };
    let string_list = |value: Option<&serde_json::Value>| -> Vec<String> {
        value
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    };
    Learning {
        content: result.content,
        kind: kind.to_string(),
        score: result.score,
        story_id: artifact
            .get("story_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        story_title: artifact
            .get("story_title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        insights: string_list(artifact.get("insights")),
        recommendations: string_list(artifact.get("recommendations")),
    }
}

// ── Deterministic derivations ────────────────────────────────────────────

/// Bucket names, in classification priority order.
const FAILURE_BUCKETS: [&str; 6] = [
    "Test failures",
    "Syntax errors",
    "Import errors",
    "Type errors",
    "Quality check failures",
    "Implementation errors",
];

/// Classify one error string into its failure bucket.  Case-insensitive
/// substring match, first hit in priority order wins.
fn classify_error(error: &str) -> &'static str {
    let lower = error.to_lowercase();
    if lower.contains("test") || lower.contains("pytest") {
        "Test failures"
    } else if lower.contains("syntax") {
        "Syntax errors"
    } else if lower.contains("import") {
        "Import errors"
    } else if lower.contains("type") {
        "Type errors"
    } else if lower.contains("quality") {
        "Quality check failures"
    } else {
        "Implementation errors"
    }
}

/// One line per non-empty bucket, `"{bucket} occurred in {n} attempt(s)"`,
/// sorted by count descending (bucket priority breaks ties).
fn analyze_failure_patterns(failures: &[&AttemptSummary]) -> Vec<String> {
    if failures.is_empty() {
        return Vec::new();
    }

    let mut counts = [0usize; FAILURE_BUCKETS.len()];
    for failure in failures {
        let error = failure.error.as_deref().unwrap_or("Unknown error");
        let bucket = classify_error(error);
        if let Some(idx) = FAILURE_BUCKETS.iter().position(|b| *b == bucket) {
            counts[idx] += 1;
        }
    }

    let mut ranked: Vec<(&str, usize)> = FAILURE_BUCKETS
        .iter()
        .zip(counts.iter())
        .filter(|(_, count)| **count > 0)
        .map(|(name, count)| (*name, *count))
        .collect();
    // Stable sort: ties keep bucket priority order.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    ranked
        .into_iter()
        .map(|(name, count)| format!("{} occurred in {} attempt(s)", name, count))
        .collect()
}

/// Identify what made the successful attempts work.
fn analyze_success_factors(
    successes: &[&AttemptSummary],
    failures: &[&AttemptSummary],
) -> Vec<String> {
    let mut factors = Vec::new();
    if successes.is_empty() {
        return factors;
    }

    let total_changes: usize = successes.iter().map(|s| s.changes_made).sum();
    let avg = total_changes as f64 / successes.len() as f64;
    factors.push(format!("Successful attempts averaged {:.1} file changes", avg));

    if !failures.is_empty() {
        factors.push("Persistence through failures led to success".to_string());
    }

    for success in successes {
        let passed: Vec<&str> = success
            .quality_checks
            .iter()
            .filter(|c| c.passed)
            .map(|c| c.name.as_str())
            .collect();
        if !passed.is_empty() {
            factors.push(format!("Passed quality checks: {}", passed.join(", ")));
            break;
        }
    }

    factors
}

/// High-level insights: an attempt-count template, the primary challenge,
/// and the key success factor.
fn generate_insights(
    story_title: &str,
    total_attempts: u32,
    final_success: bool,
    failure_patterns: &[String],
    success_factors: &[String],
) -> Vec<String> {
    let mut insights = Vec::new();

    if final_success {
        if total_attempts == 1 {
            insights.push(format!(
                "'{}' completed on first attempt - similar tasks may be straightforward",
                story_title
            ));
        } else if total_attempts <= 3 {
            insights.push(format!(
                "'{}' required {} attempts - some iteration expected",
                story_title, total_attempts
            ));
        } else {
            insights.push(format!(
                "'{}' was complex, requiring {} attempts",
                story_title, total_attempts
            ));
        }
    } else {
        insights.push(format!(
            "'{}' could not be completed after {} attempts",
            story_title, total_attempts
        ));
    }

    if let Some(top) = failure_patterns.first() {
        let primary = top.split(" occurred").next().unwrap_or(top);
        insights.push(format!("Primary challenge: {}", primary));
    }

    if let Some(factor) = success_factors.first() {
        insights.push(format!("Key success factor: {}", factor));
    }

    insights
}

/// Table-driven recommendations from the failure patterns, with two
/// defaults when nothing matched.  Capped at five.
fn generate_recommendations(
    failure_patterns: &[String],
    success_factors: &[String],
) -> Vec<String> {
    let mut recommendations = Vec::new();

    for pattern in failure_patterns {
        if pattern.contains("Test failures") {
            recommendations.push("Write tests incrementally alongside implementation".to_string());
        } else if pattern.contains("Syntax errors") {
            recommendations.push("Run syntax validation before applying changes".to_string());
        } else if pattern.contains("Import errors") {
            recommendations.push("Verify all imports exist before implementation".to_string());
        } else if pattern.contains("Type errors") {
            recommendations.push("Add type hints and run type checking early".to_string());
        }
    }

    if success_factors.iter().any(|f| f.contains("Persistence")) {
        recommendations.push("Retry with refined approach when initial attempt fails".to_string());
    }

    if recommendations.is_empty() {
        recommendations.push("Break complex tasks into smaller incremental changes".to_string());
        recommendations.push("Run quality checks after each significant change".to_string());
    }

    recommendations.truncate(MAX_RECOMMENDATIONS);
    recommendations
}
