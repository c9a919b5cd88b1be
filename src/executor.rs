//! Resolving and running tool directives.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info};

use crate::directive::{ToolDirective, ToolType, RUNTIME_MODULE};
use crate::error::{AgentError, Result};
use crate::mcp::RemoteToolClient;
use crate::message::ToolResult;
use crate::telemetry::TelemetryCollector;
use crate::tool::{ModuleTable, Tool, ToolReference, ToolRegistry};

#[derive(Clone, Default)]
pub struct ToolExecutor {
    runtime: ToolRegistry,
    modules: ModuleTable,
    telemetry: Option<TelemetryCollector>,
}

impl ToolExecutor {
    pub fn new(runtime: ToolRegistry, modules: ModuleTable) -> Self {
        Self {
            runtime,
            modules,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn runtime(&self) -> &ToolRegistry {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut ToolRegistry {
        &mut self.runtime
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// Run one directive. Resolution and invocation failures are logged and returned.
    pub async fn execute(
        &self,
        directive: &ToolDirective,
        remote: Option<&dyn RemoteToolClient>,
    ) -> Result<ToolResult> {
        let summary = format!("Completed executing tool {}", directive.call_signature());
        info!(
            tool = %directive.tool_name,
            tool_type = ?directive.tool_type,
            module_path = %directive.module_path,
            "{summary}"
        );

        match self.dispatch(directive, remote).await {
            Ok(artifact) => {
                self.record("tool_call", directive, None);
                Ok(ToolResult {
                    summary,
                    artifact,
                    tool_call_id: format!("{}.{}", directive.module_path, directive.tool_name),
                })
            }
            Err(err) => {
                error!(tool = %directive.tool_name, error = %err, "tool execution failed");
                self.record("tool_failure", directive, Some(&err));
                Err(err)
            }
        }
    }

    /// Blocking form of [`ToolExecutor::execute`]. Must not be called from inside a
    /// tokio runtime.
    pub fn execute_blocking(
        &self,
        directive: &ToolDirective,
        remote: Option<&dyn RemoteToolClient>,
    ) -> Result<ToolResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.execute(directive, remote))
    }

    /// Map a directive onto where its implementation lives. Runtime callables are
    /// bound here; module and remote tools are only named.
    pub fn reference(&self, directive: &ToolDirective) -> Result<ToolReference> {
        let name = directive.tool_name.clone();
        match directive.tool_type {
            ToolType::Function
                if directive.module_path == RUNTIME_MODULE || directive.module_path.is_empty() =>
            {
                self.runtime
                    .get(&name)
                    .map(ToolReference::Local)
                    .ok_or(AgentError::ToolNotFound(name))
            }
            // A function addressed by module path lives in that module.
            ToolType::Function | ToolType::Module => Ok(ToolReference::Module {
                path: directive.module_path.clone(),
                name,
            }),
            ToolType::Mcp => Ok(ToolReference::Remote {
                server_id: directive.module_path.clone(),
                name,
            }),
        }
    }

    async fn dispatch(
        &self,
        directive: &ToolDirective,
        remote: Option<&dyn RemoteToolClient>,
    ) -> Result<Value> {
        let arguments = directive.arguments_value();
        match self.reference(directive)? {
            ToolReference::Local(tool) => invoke(tool.as_ref(), arguments).await,
            ToolReference::Module { path, name } => {
                let tool = self.resolve_module(&path, &name)?;
                invoke(tool.as_ref(), arguments).await
            }
            ToolReference::Remote { server_id, name } => {
                let client = remote.ok_or_else(|| {
                    AgentError::resolution(&name, &server_id, "no remote tool client is configured")
                })?;
                client.call(&server_id, &name, arguments).await
            }
        }
    }

    fn resolve_module(&self, path: &str, name: &str) -> Result<Arc<dyn Tool>> {
        let module = self
            .modules
            .get(path)
            .ok_or_else(|| AgentError::resolution(name, path, "no module registered at this path"))?;
        module
            .resolve(name)
            .ok_or_else(|| AgentError::resolution(name, path, "module does not provide this tool"))
    }

    fn record(&self, kind: &str, directive: &ToolDirective, err: Option<&AgentError>) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        match err {
            None => telemetry.record(
                kind,
                json!({ "tool": directive.tool_name, "module_path": directive.module_path }),
            ),
            Some(err) => telemetry.record_failure(
                format!("tool:{}", directive.tool_name),
                err.to_string(),
                0,
            ),
        }
    }
}

async fn invoke(tool: &dyn Tool, arguments: Value) -> Result<Value> {
    tool.call(arguments).await.map_err(|err| match err {
        AgentError::ToolInvocation { .. } => err,
        other => AgentError::invocation(tool.name(), other),
    })
}
