use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde_json::json;
use toolweave::{
    init_tracing, Agent, AgentEvent, FunctionTool, GuardrailConfig, GuardrailEngine,
    GuardrailSpec, LoggingConfig, StubModel, ToolMetadataRegistry,
};

const CLOCK_CALL: &str = r#"{"tool_name": "get_current_time", "tool_type": "function", "arguments": {}, "module_path": "__runtime__"}"#;

fn utc_time() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let day = secs % 86_400;
    format!("{:02}:{:02}:{:02} UTC", day / 3600, day % 3600 / 60, day % 60)
}

fn build_agent(dir: &Path, answer: &str) -> toolweave::Result<Agent<StubModel>> {
    let model = StubModel::new(vec![CLOCK_CALL.to_string(), answer.to_string()]);
    let registry = ToolMetadataRegistry::in_dir(dir)?;
    let guardrails = GuardrailConfig {
        input: vec![GuardrailSpec::new("pii_pattern").with_param("mask", json!(true))],
        ..Default::default()
    };

    let mut agent = Agent::new(model, registry)
        .with_description("You are a concise assistant that knows the time.")
        .with_skills(vec!["Report the current UTC time".into()])
        .with_guardrails(GuardrailEngine::from_config(&guardrails)?);
    agent.register_tool(
        FunctionTool::sync("get_current_time", "Current UTC wall-clock time", |_| {
            Ok(json!(utc_time()))
        })
        .with_return_type("str"),
    )?;
    Ok(agent)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LoggingConfig::default())?;
    let workspace = tempfile::tempdir()?;

    let mut agent = build_agent(workspace.path(), "Here is the time you asked for.")?;
    let outcome = agent.invoke_blocking("What time is it? Mail me at me@example.com")?;
    println!("[blocking] {} ({:?})", outcome.answer, outcome.termination);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut agent = build_agent(workspace.path(), "The clock says it is time for tea.")?;
        let outcome = agent.invoke("What time is it?").await?;
        println!("[async] {} after {} tool call(s)", outcome.answer, outcome.tool_results.len());

        let mut agent = build_agent(workspace.path(), "Streaming the time back to you.")?;
        let mut events = agent.stream("What time is it?");
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::Chunk(chunk) => tracing::debug!(%chunk, "chunk"),
                AgentEvent::ToolResult(result) => {
                    println!("[stream] tool {} -> {}", result.tool_call_id, result.artifact_text())
                }
                AgentEvent::Completed(outcome) => println!("[stream] {}", outcome.answer),
                AgentEvent::Error(err) => eprintln!("[stream] failed: {err}"),
            }
        }
        Ok::<_, toolweave::AgentError>(())
    })?;

    Ok(())
}
