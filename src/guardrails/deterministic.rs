//! Checks that decide on their own, without asking the model for a verdict.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CheckContext, CheckOutcome, DeterministicCheck};
use crate::error::{AgentError, Result};
use crate::hooks::TokenCredentials;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiiPatternParams {
    /// Mask matches and rewrite instead of denying.
    #[serde(default)]
    pub mask: bool,
    #[serde(default)]
    pub custom_patterns: BTreeMap<String, String>,
}

/// Regex detection of common PII shapes.
pub struct PiiPatternCheck {
    mask: bool,
    patterns: Vec<(String, Regex)>,
}

impl PiiPatternCheck {
    pub fn new(params: PiiPatternParams) -> Result<Self> {
        let builtin = [
            ("SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("Credit Card", r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"),
            ("Email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("Phone", r"\b\d{3}[\s.-]?\d{3}[\s.-]?\d{4}\b"),
        ];
        let custom = params
            .custom_patterns
            .iter()
            .map(|(name, pattern)| (name.as_str(), pattern.as_str()));

        let mut patterns = Vec::new();
        for (name, pattern) in builtin.into_iter().chain(custom) {
            let regex = Regex::new(pattern).map_err(|err| {
                AgentError::configuration(format!("invalid PII pattern `{name}`: {err}"))
            })?;
            patterns.push((name.to_string(), regex));
        }

        Ok(Self {
            mask: params.mask,
            patterns,
        })
    }
}

#[async_trait]
impl DeterministicCheck for PiiPatternCheck {
    fn name(&self) -> &str {
        "pii_pattern"
    }

    async fn validate(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome> {
        let Some(text) = ctx.text else {
            return Ok(CheckOutcome::allow("nothing to inspect"));
        };

        let mut detected = Vec::new();
        let mut masked = text.to_string();
        for (kind, pattern) in &self.patterns {
            if pattern.is_match(&masked) {
                detected.push(kind.as_str());
                if self.mask {
                    masked = pattern
                        .replace_all(&masked, |caps: &regex::Captures| "*".repeat(caps[0].len()))
                        .into_owned();
                }
            }
        }

        if detected.is_empty() {
            return Ok(CheckOutcome::allow("no PII detected"));
        }
        let reason = format!("PII detected: {}", detected.join(", "));
        if self.mask {
            Ok(CheckOutcome::rewrite(reason, masked))
        } else {
            Ok(CheckOutcome::deny(reason))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionPatternParams {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

/// Case-insensitive phrase matching for well-known jailbreak wording.
pub struct InjectionPatternCheck {
    patterns: Vec<String>,
}

const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "ignore your instructions",
    "you are now a",
    "forget everything above",
    "developer mode",
    "override safety",
    "disregard guidelines",
    "reveal your system prompt",
    "jailbreak",
    "pretend you are",
    "bypass restrictions",
    "ignore safeguards",
    "admin override",
];

impl InjectionPatternCheck {
    pub fn new(params: InjectionPatternParams) -> Self {
        let patterns = INJECTION_PHRASES
            .iter()
            .map(|phrase| phrase.to_string())
            .chain(params.extra_patterns)
            .map(|phrase| phrase.to_lowercase())
            .collect();
        Self { patterns }
    }
}

#[async_trait]
impl DeterministicCheck for InjectionPatternCheck {
    fn name(&self) -> &str {
        "injection_pattern"
    }

    async fn validate(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome> {
        let Some(text) = ctx.text else {
            return Ok(CheckOutcome::allow("nothing to inspect"));
        };
        let lower = text.to_lowercase();
        let hits: Vec<&str> = self
            .patterns
            .iter()
            .filter(|phrase| lower.contains(phrase.as_str()))
            .map(String::as_str)
            .collect();

        if hits.is_empty() {
            Ok(CheckOutcome::allow("no injection phrases found"))
        } else {
            Ok(CheckOutcome::deny(format!(
                "possible prompt injection: {}",
                hits.join(", ")
            )))
        }
    }
}

pub struct AuthenticationCheck {
    credentials: TokenCredentials,
}

impl AuthenticationCheck {
    pub fn new(credentials: TokenCredentials) -> Result<Self> {
        if credentials.allowed_tokens.is_empty() {
            return Err(AgentError::configuration(
                "authentication guardrail needs at least one entry in `allowed_tokens`",
            ));
        }
        if credentials.access_token.is_none() && credentials.token_env.is_none() {
            return Err(AgentError::configuration(
                "authentication guardrail needs `access_token` or `token_env`",
            ));
        }
        Ok(Self { credentials })
    }
}

#[async_trait]
impl DeterministicCheck for AuthenticationCheck {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn validate(&self, _ctx: &CheckContext<'_>) -> Result<CheckOutcome> {
        Ok(match self.credentials.verify() {
            Ok(()) => CheckOutcome::allow("valid access token"),
            Err(reason) => CheckOutcome::deny(reason),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OsPermissionParams {
    pub allowed_operations: Vec<String>,
}

/// Asks the model which OS operations the input would perform, then compares them
/// against an allow-list. Needs both the live model and the current input.
pub struct OsPermissionCheck {
    allowed: Vec<String>,
}

impl OsPermissionCheck {
    pub fn new(params: OsPermissionParams) -> Self {
        Self {
            allowed: params
                .allowed_operations
                .into_iter()
                .map(|op| op.trim().to_lowercase())
                .collect(),
        }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "operations": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["operations"]
        })
    }
}

#[async_trait]
impl DeterministicCheck for OsPermissionCheck {
    fn name(&self) -> &str {
        "os_permission"
    }

    async fn validate(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome> {
        let (Some(model), Some(text)) = (ctx.model, ctx.text) else {
            return Err(AgentError::configuration(
                "os_permission guardrail needs the language model and the user input",
            ));
        };

        let prompt = format!(
            "List the operating-system operations (for example: read, write, delete, execute, \
             network) that fulfilling this request would perform. Use lowercase verbs.\n\
             Request:\n\"\"\"\n{text}\n\"\"\""
        );
        let answer = model.complete_structured(&prompt, &Self::schema()).await?;
        let requested: Vec<String> = answer
            .get("operations")
            .and_then(Value::as_array)
            .map(|ops| {
                ops.iter()
                    .filter_map(Value::as_str)
                    .map(|op| op.trim().to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let denied: Vec<&str> = requested
            .iter()
            .filter(|op| !self.allowed.contains(op))
            .map(String::as_str)
            .collect();
        if denied.is_empty() {
            Ok(CheckOutcome::allow("all requested operations are permitted"))
        } else {
            Ok(CheckOutcome::deny(format!(
                "operations not permitted: {}",
                denied.join(", ")
            )))
        }
    }
}
