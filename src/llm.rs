//! Chat-completion boundary for LLM-backed components.
//!
//! The engine never talks to a provider directly. Components that need a
//! model (listwise reranking, query reformulation) go through [`ChatClient`],
//! and the embedding application supplies the transport. The helpers here
//! also cover the unglamorous part of the contract: digging a JSON payload
//! out of a completion that may be wrapped in code fences or conversational
//! filler.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

/// A single-turn prompt for a chat model.
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    /// Model identifier, opaque to the engine.
    pub model: String,
    /// Optional system message.
    pub system: Option<String>,
    /// User message.
    pub user: String,
    /// Cap on generated tokens.
    pub max_output_tokens: Option<u32>,
}

impl ChatPrompt {
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            user: user.into(),
            max_output_tokens: None,
        }
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.system = Some(content.into());
        self
    }

    pub fn max_output_tokens(mut self, cap: u32) -> Self {
        self.max_output_tokens = Some(cap);
        self
    }
}

/// Completion text plus provider-reported token usage.
#[derive(Debug, Clone, Default)]
pub struct ChatOutput {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model refused: {0}")]
    Refused(String),
    #[error("empty completion")]
    Empty,
}

/// Chat transport used by LLM-backed components.
///
/// Synchronous implementations get the async variant for free; async
/// transports override `complete_async` and may leave `complete`
/// unimplemented for their runtime by delegating to a blocking bridge.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn complete(&self, prompt: &ChatPrompt) -> Result<ChatOutput, LlmError>;

    async fn complete_async(&self, prompt: &ChatPrompt) -> Result<ChatOutput, LlmError> {
        self.complete(prompt)
    }
}

/// Canned-response client for tests and offline demos.
///
/// Pops one scripted response per call; an exhausted script is a transport
/// error, which keeps accidental extra calls visible in tests.
#[derive(Debug, Default)]
pub struct ScriptedChatClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, content: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("scripted client lock")
            .push_back(Ok(content.into()));
        self
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("scripted client lock")
            .push_back(Err(message.into()));
        self
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    fn complete(&self, _prompt: &ChatPrompt) -> Result<ChatOutput, LlmError> {
        let next = self
            .responses
            .lock()
            .expect("scripted client lock")
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(ChatOutput {
                output_tokens: content.len() as u32 / 4,
                content,
                input_tokens: 0,
            }),
            Some(Err(message)) => Err(LlmError::Transport(message)),
            None => Err(LlmError::Transport("scripted responses exhausted".into())),
        }
    }
}

/// Strip a leading/trailing markdown code fence, if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    match rest.rfind("```") {
        Some(idx) => rest[..idx].trim(),
        None => rest.trim(),
    }
}

fn extract_delimited(raw: &str, open: char, close: char) -> &str {
    let stripped = strip_code_fences(raw);
    if let Some(start) = stripped.find(open) {
        let remainder = &stripped[start..];
        let mut depth = 0i32;
        for (i, c) in remainder.char_indices() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
        }
    }
    stripped
}

/// Extract the first JSON object from a completion that may carry
/// surrounding prose or code fences.
pub fn extract_json_object(raw: &str) -> &str {
    extract_delimited(raw, '{', '}')
}

/// Extract the first JSON array from a completion that may carry
/// surrounding prose or code fences.
pub fn extract_json_array(raw: &str) -> &str {
    extract_delimited(raw, '[', ']')
}
