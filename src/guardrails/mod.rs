//! Input, output and per-tool policy checks.
//!
//! A guardrail is either deterministic (it decides by itself) or judged (it adds a
//! section to one structured prompt per phase and the model decides). Deterministic
//! checks always run first; when one denies, the model is not consulted.
//!
//! Decision rule, in priority order: a critical violation blocks, a fixable one is
//! rewritten, anything else is allowed.

mod deterministic;
mod judged;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

pub use deterministic::{
    AuthenticationCheck, InjectionPatternCheck, InjectionPatternParams, OsPermissionCheck,
    OsPermissionParams, PiiPatternCheck, PiiPatternParams,
};
pub use judged::JudgedGuardrail;

use crate::error::{AgentError, Result};
use crate::hooks::TokenCredentials;
use crate::llm::LanguageModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
    Rewrite,
}

/// Per-check sub-result inside a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub violated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailDecision {
    pub allowed: bool,
    pub action: Action,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckResult>,
}

impl GuardrailDecision {
    pub fn allow(reason: impl Into<String>, checks: BTreeMap<String, CheckResult>) -> Self {
        Self {
            allowed: true,
            action: Action::Allow,
            reason: reason.into(),
            rewrite: None,
            checks,
        }
    }

    pub fn block(reason: impl Into<String>, checks: BTreeMap<String, CheckResult>) -> Self {
        Self {
            allowed: false,
            action: Action::Block,
            reason: reason.into(),
            rewrite: None,
            checks,
        }
    }

    pub fn rewrite(
        reason: impl Into<String>,
        rewrite: impl Into<String>,
        checks: BTreeMap<String, CheckResult>,
    ) -> Self {
        Self {
            allowed: true,
            action: Action::Rewrite,
            reason: reason.into(),
            rewrite: Some(rewrite.into()),
            checks,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.action == Action::Block
    }

    /// Parse the model's structured verdict.
    ///
    /// Check fields are read from `checks` or, failing that, from the top level.
    /// The action governs: `allowed` is recomputed from it, and a rewrite without
    /// replacement text is treated as a block.
    fn from_model(raw: Value, fields: &[&str]) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawDecision {
            #[serde(default)]
            allowed: Option<bool>,
            action: Action,
            #[serde(default)]
            reason: String,
            #[serde(default, alias = "rewrite_prompt", alias = "rewrite_output")]
            rewrite: Option<String>,
            #[serde(default)]
            checks: Map<String, Value>,
            #[serde(flatten)]
            extra: Map<String, Value>,
        }

        let raw: RawDecision = serde_json::from_value(raw).map_err(|err| {
            AgentError::LanguageModel(format!("malformed guardrail decision: {err}"))
        })?;

        let mut checks = BTreeMap::new();
        for field in fields {
            let value = raw.checks.get(*field).or_else(|| raw.extra.get(*field));
            let result = match value {
                Some(Value::Bool(violated)) => CheckResult {
                    violated: *violated,
                    reason: None,
                },
                Some(value) if value.is_object() => {
                    serde_json::from_value(value.clone()).unwrap_or_default()
                }
                _ => continue,
            };
            checks.insert(field.to_string(), result);
        }

        let mut decision = Self {
            allowed: raw.action != Action::Block,
            action: raw.action,
            reason: raw.reason,
            rewrite: raw.rewrite.filter(|text| !text.trim().is_empty()),
            checks,
        };
        if decision.action == Action::Rewrite && decision.rewrite.is_none() {
            warn!("guardrail asked for a rewrite without replacement text; blocking");
            decision.action = Action::Block;
            decision.allowed = false;
        }
        if raw.allowed.is_some_and(|allowed| allowed != decision.allowed) {
            debug!(action = ?decision.action, "model's `allowed` disagreed with its action");
        }
        Ok(decision)
    }
}

/// What a deterministic check concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub reason: String,
    pub rewrite: Option<String>,
}

impl CheckOutcome {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            rewrite: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            rewrite: None,
        }
    }

    pub fn rewrite(reason: impl Into<String>, rewrite: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            rewrite: Some(rewrite.into()),
        }
    }
}

/// Call-time context. Checks that need a field that is absent must fail loudly.
#[derive(Clone, Copy, Default)]
pub struct CheckContext<'a> {
    pub text: Option<&'a str>,
    pub model: Option<&'a dyn LanguageModel>,
    pub tool_name: Option<&'a str>,
}

#[async_trait]
pub trait DeterministicCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome>;
}

pub trait JudgedCheck: Send + Sync {
    /// Result field in the structured decision.
    fn name(&self) -> &str;

    fn prompt_section(&self) -> String;
}

pub enum GuardrailCheck {
    Deterministic(Box<dyn DeterministicCheck>),
    Judged(Box<dyn JudgedCheck>),
}

impl GuardrailCheck {
    pub fn deterministic<C: DeterministicCheck + 'static>(check: C) -> Self {
        Self::Deterministic(Box::new(check))
    }

    pub fn judged<C: JudgedCheck + 'static>(check: C) -> Self {
        Self::Judged(Box::new(check))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Deterministic(check) => check.name(),
            Self::Judged(check) => check.name(),
        }
    }
}

impl fmt::Debug for GuardrailCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic(check) => f.debug_tuple("Deterministic").field(&check.name()).finish(),
            Self::Judged(check) => f.debug_tuple("Judged").field(&check.name()).finish(),
        }
    }
}

/// One configured guardrail: a kind name plus free-form params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailSpec {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl GuardrailSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub input: Vec<GuardrailSpec>,
    #[serde(default)]
    pub output: Vec<GuardrailSpec>,
    #[serde(default)]
    pub tools: BTreeMap<String, Vec<GuardrailSpec>>,
}

impl GuardrailConfig {
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.tools.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Input,
    Output,
    Tool,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Input => "input",
            Phase::Output => "output",
            Phase::Tool => "tool",
        })
    }
}

pub type GuardrailFactory = Arc<dyn Fn(&Map<String, Value>) -> Result<GuardrailCheck> + Send + Sync>;

/// Known guardrail kinds by name.
#[derive(Clone)]
pub struct GuardrailKinds {
    factories: HashMap<String, GuardrailFactory>,
}

fn params<T: DeserializeOwned>(kind: &str, params: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|err| {
        AgentError::configuration(format!("invalid params for guardrail `{kind}`: {err}"))
    })
}

impl Default for GuardrailKinds {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GuardrailKinds {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct ScopeParams {
            agent_scope: Vec<String>,
        }

        let mut kinds = Self::empty();
        kinds.register("pii", |_| Ok(GuardrailCheck::judged(JudgedGuardrail::pii())));
        kinds.register("toxicity", |_| {
            Ok(GuardrailCheck::judged(JudgedGuardrail::toxicity()))
        });
        kinds.register("prompt_injection", |_| {
            Ok(GuardrailCheck::judged(JudgedGuardrail::prompt_injection()))
        });
        kinds.register("scope", |raw| {
            let scope: ScopeParams = params("scope", raw)?;
            if scope.agent_scope.is_empty() {
                return Err(AgentError::configuration(
                    "scope guardrail needs a non-empty `agent_scope`",
                ));
            }
            Ok(GuardrailCheck::judged(JudgedGuardrail::scope(&scope.agent_scope)))
        });
        kinds.register("output_pii", |_| {
            Ok(GuardrailCheck::judged(JudgedGuardrail::output_pii()))
        });
        kinds.register("output_toxicity", |_| {
            Ok(GuardrailCheck::judged(JudgedGuardrail::output_toxicity()))
        });
        kinds.register("hallucination", |_| {
            Ok(GuardrailCheck::judged(JudgedGuardrail::hallucination()))
        });
        kinds.register("pii_pattern", |raw| {
            Ok(GuardrailCheck::deterministic(PiiPatternCheck::new(params(
                "pii_pattern",
                raw,
            )?)?))
        });
        kinds.register("injection_pattern", |raw| {
            Ok(GuardrailCheck::deterministic(InjectionPatternCheck::new(
                params("injection_pattern", raw)?,
            )))
        });
        kinds.register("authentication", |raw| {
            let credentials: TokenCredentials = params("authentication", raw)?;
            Ok(GuardrailCheck::deterministic(AuthenticationCheck::new(
                credentials,
            )?))
        });
        kinds.register("os_permission", |raw| {
            Ok(GuardrailCheck::deterministic(OsPermissionCheck::new(
                params("os_permission", raw)?,
            )))
        });
        kinds
    }

    /// Add or replace a kind.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Map<String, Value>) -> Result<GuardrailCheck> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, spec: &GuardrailSpec) -> Result<GuardrailCheck> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            AgentError::configuration(format!("unknown guardrail kind `{}`", spec.name))
        })?;
        factory(&spec.params)
    }

    fn build_phase(&self, phase: Phase, specs: &[GuardrailSpec]) -> Result<Vec<GuardrailCheck>> {
        let mut checks: Vec<GuardrailCheck> = Vec::with_capacity(specs.len());
        for spec in specs {
            let check = self.build(spec)?;
            if phase == Phase::Tool && matches!(check, GuardrailCheck::Judged(_)) {
                return Err(AgentError::configuration(format!(
                    "guardrail `{}` is model-judged and cannot gate tools",
                    spec.name
                )));
            }
            if checks.iter().any(|existing| existing.name() == check.name()) {
                return Err(AgentError::configuration(format!(
                    "guardrail `{}` is configured twice for the {phase} phase",
                    check.name()
                )));
            }
            checks.push(check);
        }
        Ok(checks)
    }
}

/// Result of per-tool gating.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolGate {
    Single(GuardrailDecision),
    All(BTreeMap<String, GuardrailDecision>),
}

#[derive(Debug, Default)]
pub struct GuardrailEngine {
    input: Vec<GuardrailCheck>,
    output: Vec<GuardrailCheck>,
    tools: BTreeMap<String, Vec<GuardrailCheck>>,
}

/// Config file shape: the guardrail tables live under `[guardrails]`.
#[derive(Deserialize)]
struct GuardrailDocument {
    #[serde(default)]
    guardrails: GuardrailConfig,
}

impl GuardrailEngine {
    pub fn from_config(config: &GuardrailConfig) -> Result<Self> {
        Self::with_kinds(config, &GuardrailKinds::builtin())
    }

    /// Build every configured check. Unknown kinds fail here, not at validation time.
    pub fn with_kinds(config: &GuardrailConfig, kinds: &GuardrailKinds) -> Result<Self> {
        let input = kinds.build_phase(Phase::Input, &config.input)?;
        let output = kinds.build_phase(Phase::Output, &config.output)?;
        let mut tools = BTreeMap::new();
        for (tool_name, specs) in &config.tools {
            tools.insert(tool_name.clone(), kinds.build_phase(Phase::Tool, specs)?);
        }
        info!(
            input = input.len(),
            output = output.len(),
            tools = tools.len(),
            "guardrails loaded"
        );
        Ok(Self {
            input,
            output,
            tools,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let document: GuardrailDocument = toml::from_str(raw).map_err(|err| {
            AgentError::configuration(format!("failed to parse guardrail config: {err}"))
        })?;
        Self::from_config(&document.guardrails)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let document: GuardrailDocument = serde_json::from_str(raw).map_err(|err| {
            AgentError::configuration(format!("failed to parse guardrail config: {err}"))
        })?;
        Self::from_config(&document.guardrails)
    }

    /// Load a `.json` or `.toml` guardrail document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_toml_str(&raw),
        }
    }

    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn gates_tool(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }

    pub async fn validate_input(
        &self,
        model: &dyn LanguageModel,
        input: &str,
    ) -> Result<GuardrailDecision> {
        let ctx = CheckContext {
            text: Some(input),
            model: Some(model),
            tool_name: None,
        };
        evaluate(Phase::Input, &self.input, ctx).await
    }

    pub async fn validate_output(
        &self,
        model: &dyn LanguageModel,
        output: &str,
    ) -> Result<GuardrailDecision> {
        let ctx = CheckContext {
            text: Some(output),
            model: Some(model),
            tool_name: None,
        };
        evaluate(Phase::Output, &self.output, ctx).await
    }

    /// Gate one tool, or every configured tool when `tool_name` is `None`.
    ///
    /// `ctx.text` is the current user input; checks that need it or the model
    /// return a configuration error when they are missing.
    pub async fn validate_tools(
        &self,
        tool_name: Option<&str>,
        ctx: CheckContext<'_>,
    ) -> Result<ToolGate> {
        match tool_name {
            Some(name) => {
                let checks = self.tools.get(name).map(Vec::as_slice).unwrap_or_default();
                let ctx = CheckContext {
                    tool_name: Some(name),
                    ..ctx
                };
                Ok(ToolGate::Single(evaluate(Phase::Tool, checks, ctx).await?))
            }
            None => {
                let mut decisions = BTreeMap::new();
                for (name, checks) in &self.tools {
                    let ctx = CheckContext {
                        tool_name: Some(name.as_str()),
                        ..ctx
                    };
                    decisions.insert(name.clone(), evaluate(Phase::Tool, checks, ctx).await?);
                }
                Ok(ToolGate::All(decisions))
            }
        }
    }
}

async fn evaluate(
    phase: Phase,
    checks: &[GuardrailCheck],
    ctx: CheckContext<'_>,
) -> Result<GuardrailDecision> {
    if checks.is_empty() {
        return Err(AgentError::configuration(format!(
            "no {phase} guardrails are enabled"
        )));
    }

    let mut results = BTreeMap::new();
    let mut rewritten: Option<(String, String)> = None;
    let mut judged: Vec<&dyn JudgedCheck> = Vec::new();

    for check in checks {
        let check = match check {
            GuardrailCheck::Judged(check) => {
                judged.push(check.as_ref());
                continue;
            }
            GuardrailCheck::Deterministic(check) => check,
        };
        let current = CheckContext {
            text: rewritten.as_ref().map(|(text, _)| text.as_str()).or(ctx.text),
            ..ctx
        };
        let outcome = check.validate(&current).await?;
        results.insert(
            check.name().to_string(),
            CheckResult {
                violated: !outcome.allowed || outcome.rewrite.is_some(),
                reason: Some(outcome.reason.clone()),
            },
        );
        if !outcome.allowed {
            info!(%phase, check = check.name(), reason = %outcome.reason, "guardrail blocked");
            return Ok(GuardrailDecision::block(outcome.reason, results));
        }
        if let Some(text) = outcome.rewrite {
            rewritten = Some((text, outcome.reason));
        }
    }

    if judged.is_empty() {
        let decision = match rewritten {
            Some((text, reason)) => GuardrailDecision::rewrite(reason, text, results),
            None => GuardrailDecision::allow("all checks passed", results),
        };
        debug!(%phase, action = ?decision.action, "guardrail decision");
        return Ok(decision);
    }

    let model = ctx.model.ok_or_else(|| {
        AgentError::configuration(format!("{phase} guardrails need a language model"))
    })?;
    let text = rewritten
        .as_ref()
        .map(|(text, _)| text.as_str())
        .or(ctx.text)
        .unwrap_or_default();
    let prompt = judge_prompt(phase, &judged, text);
    let schema = decision_schema(&judged);
    let fields: Vec<&str> = judged.iter().map(|check| check.name()).collect();

    let raw = model.complete_structured(&prompt, &schema).await?;
    let mut decision = GuardrailDecision::from_model(raw, &fields)?;
    decision.checks.extend(results);
    if decision.action == Action::Allow {
        if let Some((text, reason)) = rewritten {
            decision = GuardrailDecision::rewrite(reason, text, decision.checks);
        }
    }

    info!(%phase, action = ?decision.action, reason = %decision.reason, "guardrail decision");
    Ok(decision)
}

fn judge_prompt(phase: Phase, checks: &[&dyn JudgedCheck], text: &str) -> String {
    let sections: Vec<String> = checks.iter().map(|check| check.prompt_section()).collect();
    let (role, label) = match phase {
        Phase::Output => ("AI output guardrail", "Assistant output"),
        _ => ("AI input guardrail", "User input"),
    };
    format!(
        "You are an {role}.\n\n\
         Evaluate ONLY the following checks:\n\n{sections}\n\n\
         DECISION RULES:\n\
         - any critical violation -> action = \"block\"\n\
         - unsafe but fixable -> action = \"rewrite\", with the corrected text in \"rewrite\"\n\
         - otherwise -> action = \"allow\"\n\n\
         Report every check under \"checks\" using its field name.\n\
         Return ONLY JSON matching the schema. No text outside the JSON.\n\n\
         {label}:\n\"\"\"\n{text}\n\"\"\"",
        sections = sections.join("\n\n"),
    )
}

/// JSON schema for one phase; `checks` gains one optional property per active check.
fn decision_schema(checks: &[&dyn JudgedCheck]) -> Value {
    let check_result = json!({
        "type": "object",
        "properties": {
            "violated": {"type": "boolean"},
            "reason": {"type": "string"}
        },
        "required": ["violated"]
    });
    let properties: Map<String, Value> = checks
        .iter()
        .map(|check| (check.name().to_string(), check_result.clone()))
        .collect();

    json!({
        "type": "object",
        "properties": {
            "allowed": {"type": "boolean"},
            "action": {"type": "string", "enum": ["allow", "block", "rewrite"]},
            "reason": {"type": "string"},
            "rewrite": {"type": ["string", "null"]},
            "checks": {
                "type": "object",
                "properties": properties,
                "additionalProperties": false
            }
        },
        "required": ["allowed", "action", "reason"]
    })
}
