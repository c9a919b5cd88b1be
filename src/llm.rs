//! Language model contract consumed by the agent loop and the guardrail engine.
//!
//! Transport is out of scope for this crate: implementors wrap whatever client they
//! use. `StubModel` is a deterministic model for tests and demos.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::directive::extract_json_object;
use crate::error::{AgentError, Result};
use crate::message::Message;

/// Incremental model output. Chunk boundaries carry no meaning.
pub type ChunkStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a chat given role-tagged messages.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Stream a completion. The default emits the whole completion as one chunk.
    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream> {
        let content = self.complete(messages).await?;
        Ok(stream::once(async move { Ok(content) }).boxed())
    }

    /// Ask for a single JSON value conforming to `schema`.
    async fn complete_structured(&self, prompt: &str, schema: &Value) -> Result<Value> {
        let request = [
            Message::system(format!(
                "Respond with a single JSON object that conforms to this JSON schema:\n{schema}"
            )),
            Message::user(prompt),
        ];
        let raw = self.complete(&request).await?;
        let json = extract_json_object(&raw).ok_or_else(|| {
            AgentError::LanguageModel(format!("expected a JSON object, got `{raw}`"))
        })?;
        Ok(serde_json::from_str(json)?)
    }
}

/// A deterministic model used for tests and demos.
///
/// Chat responses and structured responses are popped from two independent queues.
/// Every chat request is recorded so tests can assert on prompts and call counts.
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    structured: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<Vec<Message>>>,
    structured_prompts: Mutex<Vec<String>>,
    chunk_size: usize,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self::scripted(responses))
    }

    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            structured: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            structured_prompts: Mutex::new(Vec::new()),
            chunk_size: 8,
        }
    }

    pub fn with_structured(self, values: Vec<Value>) -> Self {
        Self {
            structured: Mutex::new(values.into()),
            ..self
        }
    }

    /// Characters per streamed chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Chat requests received so far, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn structured_prompts(&self) -> Vec<String> {
        self.structured_prompts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn next_response(&self, messages: &[Message]) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?
            .push(messages.to_vec());
        self.responses
            .lock()
            .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                AgentError::LanguageModel("StubModel ran out of scripted responses".into())
            })
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.next_response(messages)
    }

    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream> {
        let raw = self.next_response(messages)?;
        let chars: Vec<char> = raw.chars().collect();
        let chunks: Vec<Result<String>> = chars
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.iter().collect()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn complete_structured(&self, prompt: &str, _schema: &Value) -> Result<Value> {
        self.structured_prompts
            .lock()
            .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?
            .push(prompt.to_string());
        self.structured
            .lock()
            .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                AgentError::LanguageModel("StubModel ran out of structured responses".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pops_responses_and_records_requests() {
        let model = StubModel::new(vec!["first".into(), "second".into()]);

        assert_eq!(model.complete(&[Message::user("a")]).await.unwrap(), "first");
        assert_eq!(model.complete(&[Message::user("b")]).await.unwrap(), "second");
        assert!(model.complete(&[]).await.is_err());

        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1][0].content, "b");
    }

    #[tokio::test]
    async fn streams_in_fixed_size_chunks() {
        let model = StubModel::scripted(vec!["abcdefg".into()]).with_chunk_size(3);
        let chunks: Vec<String> = model
            .stream(&[Message::user("x")])
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec!["abc", "def", "g"]);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn default_structured_completion_parses_fenced_json() {
        struct Fenced;

        #[async_trait]
        impl LanguageModel for Fenced {
            async fn complete(&self, _messages: &[Message]) -> Result<String> {
                Ok("```json\n{\"allowed\": true}\n```".into())
            }
        }

        let value = Fenced
            .complete_structured("check", &json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(value, json!({"allowed": true}));
    }
}
