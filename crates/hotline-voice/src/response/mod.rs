//! Reply acquisition: one [`ResponseGateway`] contract, two strategies.
//!
//! - [`DirectInferenceClient`]: synchronous call to a conversational model, with at
//!   most one tool round trip per turn.
//! - [`QueuedBridgeClient`]: hand-off to an out-of-process worker through the shared
//!   [`QueueStore`](crate::queue::QueueStore), then wake and poll.
//!
//! Which one runs is configuration ([`ResponseStrategy`]), not a different binary.

pub mod direct;
pub mod queued;
pub mod tools;

pub use direct::{
    AnthropicProvider, ChatMessage, ChatRole, ContentBlock, DirectConfig, DirectInferenceClient,
    InferenceProvider, InferenceRequest, InferenceResponse,
};
pub use queued::{CommandWake, NoopWake, QueuedBridgeClient, WakeSignal};
pub use tools::{ClockTool, PhoneTool, ToolRegistry, ToolSpec, WeatherTool};

use crate::error::VoiceResult;
use crate::queue::QueueConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who said a line of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Assistant,
}

/// One finalized line of the call. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn caller(content: impl Into<String>) -> Self {
        Self {
            role: Role::Caller,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a strategy needs to answer one caller utterance.
#[derive(Debug, Clone, Copy)]
pub struct ResponseRequest<'a> {
    /// Unique per request; doubles as the queue message id
    pub request_id: &'a str,
    /// Raw caller id (phone number)
    pub caller_id: &'a str,
    /// Friendly name for known callers, otherwise the caller id
    pub caller_label: &'a str,
    pub text: &'a str,
    pub history: &'a [ConversationTurn],
}

/// A successful reply plus the history it extends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub history: Vec<ConversationTurn>,
}

impl Reply {
    /// Build a reply whose history is `prior` plus this exchange.
    pub fn extending(prior: &[ConversationTurn], said: &str, text: String) -> Self {
        let mut history = Vec::with_capacity(prior.len() + 2);
        history.extend_from_slice(prior);
        history.push(ConversationTurn::caller(said));
        history.push(ConversationTurn::assistant(text.clone()));
        Self { text, history }
    }
}

/// Produces the assistant's next line.
///
/// Implementations return an error instead of a fallback string; the turn
/// controller owns the apology and keeps the prior history on failure.
#[async_trait]
pub trait ResponseGateway: Send + Sync {
    async fn respond(&self, request: ResponseRequest<'_>) -> VoiceResult<Reply>;

    /// True when replies arrive out of band and the caller should hear a
    /// "one moment" cue first.
    fn is_deferred(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStrategy {
    #[default]
    Direct,
    Queued,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub strategy: ResponseStrategy,
    pub direct: DirectConfig,
    pub queued: QueueConfig,
}
