use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use toolweave::{
    Action, Agent, AppConfig, FunctionTool, GuardrailEngine, Role, StubModel, Termination,
    ToolBundle, ToolMetadataRegistry,
};

fn clock() -> FunctionTool {
    FunctionTool::sync("get_current_time", "Current wall-clock time", |_| Ok(json!("09:30")))
}

#[tokio::test]
async fn direct_answer_takes_one_iteration() {
    let dir = tempdir().unwrap();
    let model = StubModel::new(vec!["4".into()]);
    let mut agent = Agent::new(model.clone(), ToolMetadataRegistry::in_dir(dir.path()).unwrap());

    let outcome = agent.invoke("What's 2+2").await.unwrap();

    assert_eq!(outcome.answer, "4");
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.termination, Termination::Answered);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn runtime_tool_result_reaches_the_next_model_call() {
    let dir = tempdir().unwrap();
    let model = StubModel::new(vec![
        r#"{"tool_name":"get_current_time","tool_type":"function","arguments":{},"module_path":"__runtime__"}"#.into(),
        "It is 09:30.".into(),
    ]);
    let mut agent = Agent::new(model.clone(), ToolMetadataRegistry::in_dir(dir.path()).unwrap());
    agent.register_tool(clock()).unwrap();

    let outcome = agent.invoke("What time is it?").await.unwrap();

    assert_eq!(outcome.answer, "It is 09:30.");
    assert_eq!(outcome.tool_results.len(), 1);
    assert!(agent.buffer().iter().any(|m| m.role == Role::Tool));
    let requests = model.requests();
    assert!(requests[1].last().unwrap().content.contains("Tool's Result: 09:30"));
}

#[tokio::test]
async fn module_tools_are_cached_and_callable() {
    let dir = tempdir().unwrap();
    let model = StubModel::new(vec![
        r#"{"tool_name":"get_current_time","tool_type":"module","arguments":{},"module_path":"tools.clock"}"#.into(),
        "It is 09:30.".into(),
    ]);
    let mut agent = Agent::new(model, ToolMetadataRegistry::in_dir(dir.path()).unwrap());
    let names = agent
        .register_module(Arc::new(ToolBundle::new("tools.clock").with_tool(clock())))
        .unwrap();
    assert_eq!(names, vec!["get_current_time"]);
    assert!(dir.path().join("tools.clock.json").exists());

    let outcome = agent.invoke("What time is it?").await.unwrap();
    assert_eq!(
        outcome.tool_results[0].tool_call_id,
        "tools.clock.get_current_time"
    );
}

#[tokio::test]
async fn pii_input_guardrail_blocks_ssn() {
    let engine =
        GuardrailEngine::from_toml_str("[guardrails]\ninput = [{ name = \"pii\" }]").unwrap();
    let model = StubModel::scripted(vec![]).with_structured(vec![json!({
        "allowed": false,
        "action": "block",
        "reason": "Input contains a social security number.",
        "checks": {"pii": {"violated": true, "reason": "SSN"}}
    })]);

    let decision = engine
        .validate_input(&model, "my SSN is 123-45-6789")
        .await
        .unwrap();

    assert_eq!(decision.action, Action::Block);
    assert!(!decision.allowed);
}

#[tokio::test]
async fn iteration_limit_forces_one_summary_call() {
    let dir = tempdir().unwrap();
    let directive =
        r#"{"tool_name":"get_current_time","tool_type":"function","arguments":{},"module_path":"__runtime__"}"#;
    let model = StubModel::new(vec![
        directive.into(),
        directive.into(),
        "Two readings: 09:30 and 09:30.".into(),
    ]);
    let mut agent = Agent::new(model.clone(), ToolMetadataRegistry::in_dir(dir.path()).unwrap())
        .with_max_iterations(2);
    agent.register_tool(clock()).unwrap();

    let outcome = agent.invoke("Check the time twice").await.unwrap();

    assert_eq!(outcome.tool_results.len(), 2);
    assert_eq!(outcome.termination, Termination::IterationLimit);
    assert_eq!(model.calls(), 3);
    assert_eq!(outcome.answer, "Two readings: 09:30 and 09:30.");
}

#[tokio::test]
async fn agent_from_config_file() {
    let dir = tempdir().unwrap();
    let raw = format!(
        r#"
[agent]
description = "Timekeeper"
max_iterations = 3
user_id = "alice"
save_memory = true

[tools]
cache_dir = "{root}/templates"
catalog_path = "{root}/templates/tools.json"

[memory]
path = "{root}/memory.json"

[guardrails]
input = [{{ name = "pii_pattern", params = {{ mask = true }} }}]
"#,
        root = dir.path().display()
    );
    let config = AppConfig::from_toml_str(&raw).unwrap();
    let model = StubModel::new(vec!["Noted.".into()]);
    let mut agent = Agent::from_config(model.clone(), &config).await.unwrap();

    let outcome = agent.invoke("call me at 555-123-4567").await.unwrap();
    assert_eq!(outcome.answer, "Noted.");
    assert_eq!(agent.user_id(), "alice");
    assert!(model.requests()[0][0].content.starts_with("Timekeeper"));

    let memory = std::fs::read_to_string(dir.path().join("memory.json")).unwrap();
    assert!(memory.contains("************"));
    assert!(!memory.contains("555-123-4567"));
}
