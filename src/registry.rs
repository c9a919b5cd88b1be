//! Tool schemas: extraction from tool modules, the per-module cache on disk and the
//! aggregated catalog that gets embedded in prompts.
//!
//! Cache artifacts are authoritative. Once `<cache_dir>/<module>.json` exists it is
//! loaded verbatim and the module is not reflected over again. Writes go through a
//! temp file and an atomic rename, and their content is deterministic, so concurrent
//! writers from independent agents are harmless.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::directive::RUNTIME_MODULE;
use crate::error::{AgentError, Result};
use crate::mcp::McpToolDefinition;
use crate::tool::{Tool, ToolModule};

pub const DEFAULT_CACHE_DIR: &str = "templates";
pub const DEFAULT_CATALOG_FILE: &str = "tools.json";

/// Fallback type hint when a tool does not declare one.
const ANY: &str = "Any";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub tool_name: String,
    /// Argument name to default value, or to a type hint when there is no default.
    pub arguments: Map<String, Value>,
    #[serde(rename = "return")]
    pub return_type: String,
    pub docstring: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub module_path: String,
    pub tool_call_id: String,
}

pub type ToolSchemaMap = BTreeMap<String, ToolSchema>;

impl ToolSchema {
    pub fn from_tool(tool: &dyn Tool, module_path: &str, dependencies: Vec<String>) -> Self {
        let mut arguments = Map::new();
        for argument in tool.arguments() {
            let value = match (argument.default, argument.type_hint) {
                (Some(default), _) if !default.is_null() => default,
                (_, Some(hint)) => Value::String(hint),
                _ => Value::String(ANY.into()),
            };
            arguments.insert(argument.name, value);
        }

        Self {
            tool_name: tool.name().to_string(),
            arguments,
            return_type: tool.return_type().unwrap_or(ANY).to_string(),
            docstring: tool.description().trim().to_string(),
            dependencies,
            module_path: module_path.to_string(),
            tool_call_id: stable_tool_id(module_path, tool.name()),
        }
    }

    fn from_remote(server_id: &str, definition: &McpToolDefinition) -> Self {
        let mut arguments = Map::new();
        let properties = definition
            .input_schema
            .get("properties")
            .and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, spec) in properties {
                let value = spec
                    .get("default")
                    .cloned()
                    .or_else(|| spec.get("type").cloned())
                    .unwrap_or_else(|| Value::String(ANY.into()));
                arguments.insert(name.clone(), value);
            }
        }

        Self {
            tool_name: definition.name.clone(),
            arguments,
            return_type: ANY.into(),
            docstring: definition.description.clone().unwrap_or_default(),
            dependencies: Vec::new(),
            module_path: server_id.to_string(),
            tool_call_id: stable_tool_id(server_id, &definition.name),
        }
    }
}

fn stable_tool_id(module_path: &str, name: &str) -> String {
    let key = format!("{module_path}.{name}");
    format!("tool_{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

/// Reflect over a module: every public tool becomes a schema. Names starting with
/// `_` are internal and skipped.
pub fn extract_schemas(module: &dyn ToolModule) -> Result<ToolSchemaMap> {
    let path = module.path();
    let dependencies = module.dependencies();
    let mut schemas = ToolSchemaMap::new();
    for tool in module.tools()? {
        if tool.name().starts_with('_') {
            debug!(module = path, tool = tool.name(), "skipping internal tool");
            continue;
        }
        let schema = ToolSchema::from_tool(tool.as_ref(), path, dependencies.clone());
        schemas.insert(schema.tool_name.clone(), schema);
    }
    debug!(module = path, count = schemas.len(), "extracted tool schemas");
    Ok(schemas)
}

/// Known tool schemas for one agent, backed by the on-disk cache and catalog.
#[derive(Debug, Clone)]
pub struct ToolMetadataRegistry {
    cache_dir: PathBuf,
    catalog_path: PathBuf,
    schemas: ToolSchemaMap,
}

impl ToolMetadataRegistry {
    /// Open (or create) the cache directory and catalog. `reset` discards the catalog.
    pub fn open(
        cache_dir: impl Into<PathBuf>,
        catalog_path: impl Into<PathBuf>,
        reset: bool,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let catalog_path = catalog_path.into();
        if catalog_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(AgentError::configuration(format!(
                "tool catalog `{}` must be a .json file",
                catalog_path.display()
            )));
        }
        fs::create_dir_all(&cache_dir)?;
        if let Some(parent) = catalog_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut registry = Self {
            cache_dir,
            catalog_path,
            schemas: ToolSchemaMap::new(),
        };
        if reset {
            registry.persist_catalog()?;
        } else {
            registry.schemas = registry.load_catalog()?;
        }
        Ok(registry)
    }

    /// Registry rooted in `dir`, using `dir/tools.json` as the catalog.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::open(dir, dir.join(DEFAULT_CATALOG_FILE), false)
    }

    fn load_catalog(&self) -> Result<ToolSchemaMap> {
        let raw = match fs::read_to_string(&self.catalog_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolSchemaMap::new());
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(schemas) => Ok(schemas),
            Err(err) => {
                warn!(
                    path = %self.catalog_path.display(),
                    error = %err,
                    "tool catalog is corrupt; resetting it"
                );
                write_json_atomic(&self.catalog_path, &ToolSchemaMap::new())?;
                Ok(ToolSchemaMap::new())
            }
        }
    }

    fn persist_catalog(&self) -> Result<()> {
        write_json_atomic(&self.catalog_path, &self.schemas)
    }

    /// `<cache_dir>/<module path>.json`, keyed by the whole dotted path so that
    /// `finance.stocks` and `crypto.stocks` never share a file.
    pub fn cache_path(&self, module_path: &str) -> PathBuf {
        let file_stem: String = module_path
            .chars()
            .map(|ch| if matches!(ch, '/' | '\\' | ':') { '_' } else { ch })
            .collect();
        self.cache_dir.join(format!("{file_stem}.json"))
    }

    /// Load the module's cached schemas, reflecting and persisting only on a miss.
    pub fn extract_or_load(&self, module: &dyn ToolModule) -> Result<ToolSchemaMap> {
        let cache_path = self.cache_path(module.path());
        match fs::read_to_string(&cache_path) {
            Ok(raw) => match serde_json::from_str::<ToolSchemaMap>(&raw) {
                Ok(schemas)
                    if schemas
                        .values()
                        .all(|schema| schema.module_path == module.path()) =>
                {
                    debug!(module = module.path(), path = %cache_path.display(), "tool schema cache hit");
                    return Ok(schemas);
                }
                Ok(_) => warn!(
                    module = module.path(),
                    path = %cache_path.display(),
                    "tool schema cache belongs to another module; extracting again"
                ),
                Err(err) => warn!(
                    module = module.path(),
                    error = %err,
                    "tool schema cache unreadable; extracting again"
                ),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let schemas = extract_schemas(module)?;
        write_json_atomic(&cache_path, &schemas)?;
        info!(module = module.path(), path = %cache_path.display(), "saved tool schemas");
        Ok(schemas)
    }

    /// Add a module's schemas to the catalog. All-or-nothing on name collisions.
    pub fn register_module(&mut self, module: &dyn ToolModule) -> Result<Vec<String>> {
        let schemas = self.extract_or_load(module)?;
        self.merge(schemas)
    }

    /// Register many modules. A broken module is logged and skipped; the rest still load.
    pub fn discover(&mut self, modules: &[Arc<dyn ToolModule>]) -> Vec<String> {
        let mut registered = Vec::new();
        for module in modules {
            match self.register_module(module.as_ref()) {
                Ok(names) => registered.extend(names),
                Err(err) => error!(
                    module = module.path(),
                    error = %err,
                    "failed to load tool metadata; skipping module"
                ),
            }
        }
        registered
    }

    pub fn register_function(&mut self, tool: &dyn Tool) -> Result<ToolSchema> {
        let schema = ToolSchema::from_tool(tool, RUNTIME_MODULE, Vec::new());
        self.merge(ToolSchemaMap::from([(schema.tool_name.clone(), schema.clone())]))?;
        info!(tool = %schema.tool_name, "registered runtime tool");
        Ok(schema)
    }

    pub fn register_remote(
        &mut self,
        server_id: &str,
        definitions: &[McpToolDefinition],
    ) -> Result<Vec<String>> {
        let schemas = definitions
            .iter()
            .map(|definition| {
                let schema = ToolSchema::from_remote(server_id, definition);
                (schema.tool_name.clone(), schema)
            })
            .collect();
        self.merge(schemas)
    }

    fn merge(&mut self, incoming: ToolSchemaMap) -> Result<Vec<String>> {
        for (name, schema) in &incoming {
            if let Some(existing) = self.schemas.get(name) {
                if existing.module_path != schema.module_path {
                    return Err(AgentError::configuration(format!(
                        "tool `{name}` from `{}` collides with the one from `{}`",
                        schema.module_path, existing.module_path
                    )));
                }
            }
        }
        let names: Vec<String> = incoming.keys().cloned().collect();
        self.schemas.extend(incoming);
        self.persist_catalog()?;
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.schemas.get(name)
    }

    pub fn schemas(&self) -> &ToolSchemaMap {
        &self.schemas
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Compact JSON rendering of the catalog for prompts.
    pub fn catalog_json(&self) -> String {
        serde_json::to_string(&self.schemas).unwrap_or_else(|_| "{}".to_string())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.persist(path).map_err(|err| AgentError::Io(err.error))?;
    Ok(())
}
