//! Tool-augmented agent loop.
//!
//! An [`Agent`] asks a [`LanguageModel`] for either an answer or a JSON tool
//! directive, executes the directive through a [`ToolExecutor`] and feeds the
//! result back until the model answers or the iteration limit is reached.
//!
//! Around the loop:
//! - [`ToolMetadataRegistry`] extracts and caches the tool catalog the model sees.
//! - [`GuardrailEngine`] validates input, output and individual tool calls.
//! - [`McpClientPool`] reaches tools hosted on MCP servers.
//! - [`MemoryStore`] keeps per-user long-term memory.

mod agent;
mod buffer;
mod config;
mod directive;
mod error;
mod executor;
mod flow;
pub mod guardrails;
mod hooks;
mod llm;
pub mod mcp;
mod memory;
mod message;
mod registry;
mod telemetry;
mod tool;

pub use agent::{Agent, AgentEvent, AgentOutcome, Termination};
pub use buffer::{ConversationBuffer, DEFAULT_BUFFER_SIZE};
pub use config::{
    AgentSettings, AppConfig, LoggingConfig, McpConfig, McpServerConfig, MemoryConfig,
    ToolsConfig, DEFAULT_USER_ID,
};
pub use directive::{extract_json_object, ToolDirective, ToolType, RUNTIME_MODULE};
pub use error::{AgentError, Result};
pub use executor::ToolExecutor;
pub use flow::{CompiledFlow, FlowConfig};
pub use guardrails::{
    Action, GuardrailConfig, GuardrailDecision, GuardrailEngine, GuardrailSpec, ToolGate,
};
pub use hooks::{Authenticator, TokenCredentials};
pub use llm::{ChunkStream, LanguageModel, StubModel};
pub use mcp::{McpClient, McpClientPool, McpToolDefinition, RemoteToolClient};
pub use memory::{FileMemoryStore, InMemoryStore, MemoryStore};
pub use message::{Message, Role, ToolResult};
pub use registry::{
    extract_schemas, ToolMetadataRegistry, ToolSchema, ToolSchemaMap, DEFAULT_CACHE_DIR,
    DEFAULT_CATALOG_FILE,
};
pub use telemetry::{init_tracing, FailureRecord, TelemetryCollector, TelemetryEvent};
pub use tool::{
    ArgumentSpec, FunctionTool, ModuleTable, Tool, ToolBundle, ToolModule, ToolReference, ToolRegistry,
};
