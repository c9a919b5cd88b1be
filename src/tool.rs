use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{AgentError, Result};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Ordered argument list. Feeds the schema the model sees.
    fn arguments(&self) -> Vec<ArgumentSpec> {
        Vec::new()
    }

    fn return_type(&self) -> Option<&str> {
        None
    }

    async fn call(&self, input: Value) -> Result<Value>;
}

/// One declared tool argument. A default takes precedence over the type hint in schemas.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpec {
    pub name: String,
    pub type_hint: Option<String>,
    pub default: Option<Value>,
}

impl ArgumentSpec {
    pub fn typed(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(type_hint.into()),
            default: None,
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

type ToolFuture = BoxFuture<'static, Result<Value>>;

/// Wrap a plain async closure as a tool.
pub struct FunctionTool {
    name: String,
    description: String,
    arguments: Vec<ArgumentSpec>,
    return_type: Option<String>,
    func: Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            arguments: Vec::new(),
            return_type: None,
            func: Arc::new(move |input| -> ToolFuture { Box::pin(func(input)) }),
        }
    }

    /// Same as [`FunctionTool::new`] for closures that never suspend.
    pub fn sync<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(name, description, move |input| {
            let func = Arc::clone(&func);
            async move { func(input) }
        })
    }

    pub fn with_argument(mut self, argument: ArgumentSpec) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_return_type(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = Some(return_type.into());
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn arguments(&self) -> Vec<ArgumentSpec> {
        self.arguments.clone()
    }

    fn return_type(&self) -> Option<&str> {
        self.return_type.as_deref()
    }

    async fn call(&self, input: Value) -> Result<Value> {
        (self.func)(input).await
    }
}

/// A unit that provides tools under a dotted path, e.g. `finance.stocks`.
///
/// `tools` is the reflection hook: it may fail when the source is broken, and
/// discovery isolates that failure to this module.
pub trait ToolModule: Send + Sync {
    fn path(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn tools(&self) -> Result<Vec<Arc<dyn Tool>>>;

    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools()
            .ok()?
            .into_iter()
            .find(|tool| tool.name() == name)
    }
}

/// The simplest `ToolModule`: a fixed list of tools under a path.
#[derive(Clone)]
pub struct ToolBundle {
    path: String,
    dependencies: Vec<String>,
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolBundle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dependencies: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

impl ToolModule for ToolBundle {
    fn path(&self) -> &str {
        &self.path
    }

    fn dependencies(&self) -> Vec<String> {
        let mut deps = self.dependencies.clone();
        deps.sort();
        deps.dedup();
        deps
    }

    fn tools(&self) -> Result<Vec<Arc<dyn Tool>>> {
        Ok(self.tools.clone())
    }
}

/// Modules available for `module` directives, keyed by path.
///
/// Registering a path again replaces the previous module; executions resolve lazily,
/// so the replacement is picked up by the next call.
#[derive(Default, Clone)]
pub struct ModuleTable {
    modules: Arc<RwLock<HashMap<String, Arc<dyn ToolModule>>>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are inserted whole, so a poisoned lock still guards a consistent map.
    pub fn register(&self, module: Arc<dyn ToolModule>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.path().to_string(), module);
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn ToolModule>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

/// Callables registered at runtime, addressed with the `__runtime__` location hint.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<Arc<dyn Tool>> {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(AgentError::configuration(format!(
                "a runtime tool named `{name}` is already registered"
            )));
        }
        self.tools.insert(name, Arc::clone(&tool));
        Ok(tool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Where a tool implementation lives. `Local` is bound when the directive is
/// resolved; `Module` and `Remote` are looked up at call time, so a re-registered
/// module path is picked up by the next execution.
#[derive(Clone)]
pub enum ToolReference {
    Local(Arc<dyn Tool>),
    Module { path: String, name: String },
    Remote { server_id: String, name: String },
}

impl ToolReference {
    pub fn name(&self) -> &str {
        match self {
            ToolReference::Local(tool) => tool.name(),
            ToolReference::Module { name, .. } | ToolReference::Remote { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for ToolReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolReference::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            ToolReference::Module { path, name } => f
                .debug_struct("Module")
                .field("path", path)
                .field("name", name)
                .finish(),
            ToolReference::Remote { server_id, name } => f
                .debug_struct("Remote")
                .field("server_id", server_id)
                .field("name", name)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> FunctionTool {
        FunctionTool::sync("echo", "Echo the payload", |input| Ok(json!({ "echo": input })))
    }

    #[tokio::test]
    async fn function_tool_invokes_closure() {
        let tool = FunctionTool::new("double", "Double `n`", |input: Value| async move {
            let n = input.get("n").and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        })
        .with_argument(ArgumentSpec::typed("n", "int"))
        .with_return_type("int");

        assert_eq!(tool.call(json!({"n": 21})).await.unwrap(), json!(42));
        assert_eq!(tool.arguments()[0].name, "n");
        assert_eq!(tool.return_type(), Some("int"));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();
        let err = registry.register(echo()).err().unwrap();
        assert!(matches!(err, AgentError::Configuration(_)));
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn module_table_replaces_on_reregistration() {
        let table = ModuleTable::new();
        table.register(Arc::new(ToolBundle::new("util").with_tool(echo())));
        assert!(table.get("util").unwrap().resolve("echo").is_some());

        let replacement = FunctionTool::sync("ping", "Reply pong", |_| Ok(json!("pong")));
        table.register(Arc::new(ToolBundle::new("util").with_tool(replacement)));

        let module = table.get("util").unwrap();
        assert!(module.resolve("echo").is_none());
        assert!(module.resolve("ping").is_some());
        assert_eq!(table.paths(), vec!["util".to_string()]);
    }

    #[test]
    fn module_table_survives_a_poisoned_lock() {
        let table = ModuleTable::new();
        let shared = table.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.modules.write().unwrap();
            panic!("writer panicked while holding the lock");
        })
        .join();
        assert!(table.modules.is_poisoned());

        table.register(Arc::new(ToolBundle::new("util").with_tool(echo())));
        assert!(table.get("util").unwrap().resolve("echo").is_some());
        assert_eq!(table.paths(), vec!["util".to_string()]);
    }

    #[test]
    fn bundle_dependencies_are_sorted_and_unique() {
        let bundle = ToolBundle::new("m")
            .with_dependency("serde")
            .with_dependency("chrono")
            .with_dependency("serde");
        assert_eq!(bundle.dependencies(), vec!["chrono", "serde"]);
    }
}
