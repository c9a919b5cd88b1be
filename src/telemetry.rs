use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AgentError, Result};

/// Install the global `tracing` subscriber. Calling it again is a no-op.
///
/// `RUST_LOG` wins over the configured filter when it is set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|err| {
            AgentError::configuration(format!("invalid log filter `{}`: {err}", config.filter))
        })?;

    let builder = fmt().with_env_filter(filter).with_target(config.with_target);
    // A subscriber installed elsewhere keeps precedence.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub timestamp: SystemTime,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: String,
    pub error: String,
    pub iteration: u32,
}

/// In-process sink for model calls, tool calls and failures.
#[derive(Default, Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    failures: Arc<Mutex<Vec<FailureRecord>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: impl Into<String>, detail: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(TelemetryEvent {
                kind: kind.into(),
                timestamp: SystemTime::now(),
                detail,
            });
        }
    }

    pub fn record_failure(
        &self,
        context: impl Into<String>,
        error: impl Into<String>,
        iteration: u32,
    ) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(FailureRecord {
                context: context.into(),
                error: error.into(),
                iteration,
            });
        }
    }

    /// Number of recorded events of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|event| event.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn drain(&self) -> (Vec<TelemetryEvent>, Vec<FailureRecord>) {
        let events = self
            .events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default();
        let failures = self
            .failures
            .lock()
            .map(|mut failures| std::mem::take(&mut *failures))
            .unwrap_or_default();
        (events, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_and_drains() {
        let telemetry = TelemetryCollector::new();
        let shared = telemetry.clone();
        shared.record("model_call", json!({"iteration": 1}));
        shared.record("tool_call", json!({"tool": "clock"}));
        shared.record("model_call", json!({"iteration": 2}));
        telemetry.record_failure("tool:clock", "boom", 2);

        assert_eq!(telemetry.count("model_call"), 2);
        let (events, failures) = telemetry.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(failures[0].iteration, 2);
        assert!(telemetry.drain().0.is_empty());
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config).unwrap();
        init_tracing(&config).unwrap();
    }

    #[test]
    fn rejects_malformed_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "toolweave=notalevel".into(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_tracing(&config),
            Err(AgentError::Configuration(_))
        ));
    }
}
