//! Turn a free-form code request into a structured PRD.
//!
//! One LLM call, one pure transform: the builder asks the model to act as a
//! product manager and emit strict JSON, then parses it with two fallbacks:
//! brace extraction for chatty responses, and a deterministic one-story PRD
//! when nothing parseable comes back.  `build_prd` therefore never fails.

use crate::agentry::llm_client::{ChatMessage, CompletionOptions, LlmClient};
use crate::agentry::ralph::{Prd, UserStory};
use crate::agentry::session_store::SessionStore;
use std::sync::Arc;

/// Largest number of stories a generated PRD may carry.
const MAX_STORIES: usize = 5;

/// Builds PRDs from user requests.
pub struct PrdBuilder {
    llm: Arc<dyn LlmClient>,
    store: Arc<SessionStore>,
}

impl PrdBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<SessionStore>) -> Self {
        Self { llm, store }
    }

    /// Generate a PRD for `user_message`, consulting up to five recent
    /// session messages for context.  Falls back to a minimal one-story PRD
    /// when the model's output cannot be parsed.
    pub async fn build_prd(&self, user_message: &str, session_id: &str) -> Prd {
        let prompt = format!(
            "Analyze this code generation request and create a formal PRD \
             (Product Requirements Document).\n\n\
             User Request:\n{}\n\n\
             You MUST respond with ONLY valid JSON in this exact format (no other text):\n\
             {{\n\
             \x20   \"name\": \"Short project name\",\n\
             \x20   \"description\": \"Brief project description\",\n\
             \x20   \"branchName\": \"feature/descriptive-branch-name\",\n\
             \x20   \"userStories\": [\n\
             \x20       {{\n\
             \x20           \"id\": \"US-001\",\n\
             \x20           \"title\": \"Story title\",\n\
             \x20           \"description\": \"Detailed description of what needs to be done\",\n\
             \x20           \"acceptanceCriteria\": [\n\
             \x20               \"Criterion 1\",\n\
             \x20               \"Criterion 2\"\n\
             \x20           ],\n\
             \x20           \"priority\": 1\n\
             \x20       }}\n\
             \x20   ]\n\
             }}\n\n\
             Break down the request into 1-5 user stories, each with clear acceptance criteria.\n\
             Priority 1 = highest priority, implement first.\n\
             Generate a descriptive branch name from the project name.",
            user_message
        );

        let mut messages = vec![ChatMessage::system(
            "You are a Product Manager AI that creates structured PRDs. Output ONLY valid JSON.",
        )];
        match self.store.recent_context(session_id, 5).await {
            Ok(context) => messages.extend(context),
            Err(e) => log::warn!("could not load session context for PRD: {}", e),
        }
        messages.push(ChatMessage::user(prompt));

        let completion = match self.llm.complete(&messages, &CompletionOptions::default()).await {
            Ok(completion) => completion,
            Err(e) => {
                log::error!("failed to generate PRD: {}", e);
                return fallback_prd(user_message);
            }
        };

        match parse_prd(&completion.content) {
            Some(mut prd) => {
                prd.stories.truncate(MAX_STORIES);
                log::info!("generated PRD: {} with {} stories", prd.name, prd.stories.len());
                prd
            }
            None => {
                log::error!(
                    "failed to parse PRD JSON from response: {}",
                    crate::agentry::llm_client::truncate(&completion.content, 200)
                );
                fallback_prd(user_message)
            }
        }
    }
}

/// Strict parse first, then the first `{ … }` substring.
fn parse_prd(text: &str) -> Option<Prd> {
    let direct = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .or_else(|| {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            if end <= start {
                return None;
            }
            serde_json::from_str(&text[start..=end]).ok()
        })?;
    let prd = Prd::from_value(direct).ok()?;
    if prd.stories.is_empty() {
        return None;
    }
    Some(prd)
}

/// The deterministic one-story PRD used when generation fails entirely.
fn fallback_prd(user_message: &str) -> Prd {
    let description: String = user_message.chars().take(200).collect();
    Prd::new(
        "Code Request",
        description,
        "feature/code-implementation",
        vec![UserStory::new(
            "US-001",
            "Implement requested feature",
            user_message,
            vec![
                "Code compiles without errors".to_string(),
                "All requirements met".to_string(),
            ],
            1,
        )],
    )
}
