use agentry::agent_manager::{
    AgentManager, AgentRole, AgentSpec, AgentStatus, CoordinationMode, TaskSpec, BROADCAST,
};
use agentry::llm_client::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmError, TokenUsage};
use agentry::realtime::RealtimeBus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

struct MockLlm {
    response: String,
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: self.response.clone(),
            finish_reason: Some("stop".to_string()),
            model: "mock".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Replies with the user message itself, so prompts can be inspected
/// through outputs.
struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let content = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Completion {
            content,
            finish_reason: Some("stop".to_string()),
            model: "echo".to_string(),
            usage: TokenUsage::default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        Err(LlmError::Permanent {
            status: Some(400),
            message: "bad request".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

struct SlowLlm;

#[async_trait]
impl LlmClient for SlowLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Completion {
            content: "too late".to_string(),
            finish_reason: None,
            model: "slow".to_string(),
            usage: TokenUsage::default(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

fn manager(llm: Arc<dyn LlmClient>) -> AgentManager {
    AgentManager::new(llm, Arc::new(RealtimeBus::new()))
}

#[tokio::test]
async fn agent_names_are_unique_among_live_agents() {
    let manager = manager(Arc::new(MockLlm {
        response: "ok".to_string(),
    }));

    let first = manager
        .create_agent(AgentSpec::new("worker", AgentRole::Research))
        .await
        .unwrap();
    assert_eq!(first.status, AgentStatus::Pending);

    // Same name while alive: rejected.
    let clash = manager
        .create_agent(AgentSpec::new("worker", AgentRole::Code))
        .await;
    assert!(clash.is_err());

    // Termination frees the name.
    assert!(manager.terminate_agent(&first.id).await);
    assert!(manager
        .create_agent(AgentSpec::new("worker", AgentRole::Code))
        .await
        .is_ok());
}

#[tokio::test]
async fn templates_fill_missing_prompt_and_capabilities() {
    let manager = manager(Arc::new(MockLlm {
        response: "ok".to_string(),
    }));
    let agent = manager
        .create_agent(AgentSpec::new("researcher", AgentRole::Research))
        .await
        .unwrap();
    assert!(agent.capabilities.contains(&"web_search".to_string()));

    let custom = manager
        .create_agent(
            AgentSpec::new("special", AgentRole::Code)
                .with_system_prompt("custom prompt")
                .with_capabilities(vec!["only_this".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(custom.capabilities, vec!["only_this"]);
}

#[tokio::test]
async fn execute_task_records_history_and_tokens() {
    let manager = manager(Arc::new(MockLlm {
        response: "the answer".to_string(),
    }));
    let agent = manager
        .create_agent(AgentSpec::new("a", AgentRole::Research))
        .await
        .unwrap();

    let result = manager
        .execute_task(&agent.id, "what is the answer?", Duration::from_secs(5), false)
        .await;
    assert_eq!(result.output.as_deref(), Some("the answer"));
    assert!(result.error.is_none());

    let snapshot = manager.get_agent(&agent.id).await.unwrap();
    assert_eq!(snapshot.status, AgentStatus::Completed);
    assert_eq!(snapshot.task_attempts, 1);
    assert_eq!(snapshot.input_tokens, 10);
    assert_eq!(snapshot.output_tokens, 5);
    assert!(snapshot.current_task.is_none());
}

#[tokio::test]
async fn missing_agent_yields_error_result() {
    let manager = manager(Arc::new(MockLlm {
        response: "x".to_string(),
    }));
    let result = manager
        .execute_task("no-such-id", "task", Duration::from_secs(1), false)
        .await;
    assert!(result.error.unwrap().contains("not found"));
}

#[tokio::test]
async fn llm_failure_keeps_agent_reusable() {
    let manager = manager(Arc::new(FailingLlm));
    let agent = manager
        .create_agent(AgentSpec::new("a", AgentRole::Code))
        .await
        .unwrap();

    let result = manager
        .execute_task(&agent.id, "task", Duration::from_secs(5), false)
        .await;
    assert!(result.error.unwrap().contains("bad request"));

    // The agent survives a failed task and can be used again.
    let snapshot = manager.get_agent(&agent.id).await.unwrap();
    assert_eq!(snapshot.status, AgentStatus::Completed);
    assert_eq!(snapshot.task_attempts, 1);
}

#[tokio::test]
async fn task_timeout_is_recorded_as_timeout() {
    let manager = manager(Arc::new(SlowLlm));
    let agent = manager
        .create_agent(AgentSpec::new("a", AgentRole::Research))
        .await
        .unwrap();

    let result = manager
        .execute_task(&agent.id, "task", Duration::from_millis(50), false)
        .await;
    assert_eq!(result.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn parallel_tasks_join_all_results() {
    let manager = manager(Arc::new(MockLlm {
        response: "done".to_string(),
    }));
    let a = manager
        .create_agent(AgentSpec::new("a", AgentRole::Research))
        .await
        .unwrap();
    let b = manager
        .create_agent(AgentSpec::new("b", AgentRole::Verify))
        .await
        .unwrap();

    let results = manager
        .execute_parallel_tasks(
            vec![
                TaskSpec {
                    agent_id: a.id.clone(),
                    task: "t1".to_string(),
                },
                TaskSpec {
                    agent_id: b.id.clone(),
                    task: "t2".to_string(),
                },
            ],
            CoordinationMode::Collaborative,
            Duration::from_secs(5),
        )
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[&a.id].output.as_deref(), Some("done"));
    assert_eq!(results[&b.id].output.as_deref(), Some("done"));
}

#[tokio::test]
async fn canonical_workflow_spawns_three_roles_and_synthesizes() {
    let manager = Arc::new(manager(Arc::new(EchoLlm)));
    let outcome = manager
        .execute_workflow_parallel("research_verify_synthesize", "history of rust", None)
        .await
        .unwrap();

    assert_eq!(outcome.agent_ids.len(), 3);
    assert_eq!(manager.list_agents(None, Some(AgentRole::Research)).await.len(), 1);
    assert_eq!(manager.list_agents(None, Some(AgentRole::Verify)).await.len(), 1);
    assert_eq!(manager.list_agents(None, Some(AgentRole::Synthesis)).await.len(), 1);

    // Echo client: outputs mirror the composed prompts.
    assert!(outcome.research.output.unwrap().contains("history of rust"));
    assert!(outcome
        .verify
        .output
        .unwrap()
        .contains("Verify the following topic"));
    let synthesis = outcome.synthesis.output.unwrap();
    assert!(synthesis.contains("Research Results:"));
    assert!(synthesis.contains("Verification Results:"));
}

#[tokio::test]
async fn unknown_workflow_is_rejected() {
    let manager = manager(Arc::new(MockLlm {
        response: "x".to_string(),
    }));
    assert!(manager
        .execute_workflow_parallel("code_review", "t", None)
        .await
        .is_err());
}

#[tokio::test]
async fn messages_are_delivered_in_send_order() {
    let manager = manager(Arc::new(MockLlm {
        response: "x".to_string(),
    }));
    manager.start().await;

    let a = manager
        .create_agent(AgentSpec::new("alice", AgentRole::Research))
        .await
        .unwrap();
    let b = manager
        .create_agent(AgentSpec::new("bob", AgentRole::Verify))
        .await
        .unwrap();

    for i in 0..5 {
        manager
            .send_message(&a.id, &b.id, &format!("msg {}", i), "message")
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Received sequence is a contiguous prefix of the sent sequence.
    let mut received = Vec::new();
    while let Some(message) = manager.pop_message(&b.id).await {
        assert_eq!(message.from_id, a.id);
        received.push(message.body);
    }
    assert_eq!(received, (0..5).map(|i| format!("msg {}", i)).collect::<Vec<_>>());

    manager.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let manager = manager(Arc::new(MockLlm {
        response: "x".to_string(),
    }));
    manager.start().await;

    let a = manager
        .create_agent(AgentSpec::new("a", AgentRole::Research))
        .await
        .unwrap();
    let b = manager
        .create_agent(AgentSpec::new("b", AgentRole::Verify))
        .await
        .unwrap();
    let c = manager
        .create_agent(AgentSpec::new("c", AgentRole::Synthesis))
        .await
        .unwrap();

    manager
        .send_message(&a.id, BROADCAST, "hello all", "announcement")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(manager.pop_message(&b.id).await.is_some());
    assert!(manager.pop_message(&c.id).await.is_some());
    assert!(manager.pop_message(&a.id).await.is_none());

    manager.stop().await;
}
