//! Delegation to an externally compiled flow.
//!
//! When an agent is given a [`CompiledFlow`] the tool loop is bypassed entirely:
//! the query goes to the flow and whatever it answers is the agent's answer.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::ChunkStream;

/// Per-run settings handed to the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub user_id: String,
    pub thread_id: String,
}

impl FlowConfig {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

#[async_trait]
pub trait CompiledFlow: Send + Sync {
    async fn invoke(&self, input: &str, config: &FlowConfig) -> Result<String>;

    /// Incremental output. Defaults to the whole answer as a single chunk.
    async fn stream(&self, input: &str, config: &FlowConfig) -> Result<ChunkStream> {
        let answer = self.invoke(input, config).await?;
        Ok(stream::once(async move { Ok(answer) }).boxed())
    }
}
