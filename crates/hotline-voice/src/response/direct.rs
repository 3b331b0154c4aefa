//! Direct strategy: one synchronous model call per turn, plus at most one tool round trip.

use super::tools::{ToolRegistry, ToolSpec};
use super::{Reply, ResponseGateway, ResponseRequest, Role};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placeholder in the system prompt replaced by the current local time.
pub const TIME_PLACEHOLDER: &str = "{time}";

const TOOL_NOT_EXECUTED: &str = "Not executed: only one tool runs per turn.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub api_url: String,
    pub model: String,

    /// Reply-length budget; keeps spoken answers short (default: 150)
    pub max_tokens: u32,

    /// Per-request HTTP timeout (default: 30000ms)
    pub request_timeout_ms: u64,

    /// System prompt; `{time}` is replaced by the current local time
    pub system_prompt: String,

    /// Local timezone as minutes east of UTC (default: 240, Gulf time)
    pub utc_offset_minutes: i32,

    pub timezone_label: String,

    pub tools_enabled: bool,
    pub weather_url: String,
    pub weather_location: String,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 150,
            request_timeout_ms: 30_000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            utc_offset_minutes: 240,
            timezone_label: "Dubai".to_string(),
            tools_enabled: true,
            weather_url: "https://wttr.in".to_string(),
            weather_location: "Dubai".to_string(),
        }
    }
}

impl DirectConfig {
    pub fn offset(&self) -> VoiceResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            VoiceError::Config(format!("invalid utc offset {}", self.utc_offset_minutes))
        })
    }

    /// Clock and weather tools, or none when disabled.
    pub fn tool_registry(&self) -> VoiceResult<ToolRegistry> {
        if !self.tools_enabled {
            return Ok(ToolRegistry::new());
        }
        Ok(ToolRegistry::phone_defaults(
            self.offset()?,
            &self.timezone_label,
            &self.weather_url,
            &self.weather_location,
        ))
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are Viktor, the front desk specialist. You're answering a phone call.

CRITICAL RULES:
- Keep responses SHORT (1-2 sentences max). This is spoken aloud.
- Be natural and conversational, not robotic.
- Use casual language appropriate for a phone call.
- If you need to look something up, say \"let me check\" first.
- Never use markdown, bullet points, or formatting.
- Never say \"I don't have access to\". Just try to help.

Current time: {time}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Messages API content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block types this client does not understand; never sent back.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub system: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl InferenceResponse {
    pub fn wants_tool(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
            && self
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// First non-empty text block.
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        })
    }
}

/// A conversational model endpoint.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> VoiceResult<InferenceResponse>;
}

/// Anthropic Messages API provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(config: &DirectConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a InferenceRequest,
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    async fn complete(&self, request: &InferenceRequest) -> VoiceResult<InferenceResponse> {
        let body = MessagesBody {
            model: &self.model,
            request,
        };
        let res = self
            .client
            .post(format!("{}/messages", self.api_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "inference API error {}: {}",
                status, text
            )));
        }
        res.json()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))
    }
}

/// Synchronous reply strategy.
///
/// If the model asks for tools, only the first requested tool runs; any other
/// `tool_use` blocks in that response are answered with an error result so the
/// follow-up request stays well formed. Exactly one follow-up call is made and its
/// text is final, even if it asks for more tools.
pub struct DirectInferenceClient {
    provider: Arc<dyn InferenceProvider>,
    tools: ToolRegistry,
    system_prompt: String,
    max_tokens: u32,
    offset: FixedOffset,
}

impl DirectInferenceClient {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        tools: ToolRegistry,
        config: &DirectConfig,
    ) -> VoiceResult<Self> {
        Ok(Self {
            provider,
            tools,
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            offset: config.offset()?,
        })
    }

    fn system_prompt(&self) -> String {
        let now = Utc::now()
            .with_timezone(&self.offset)
            .format("%-m/%-d/%Y, %-I:%M:%S %p")
            .to_string();
        self.system_prompt.replace(TIME_PLACEHOLDER, &now)
    }

    fn messages_for(request: &ResponseRequest<'_>) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = request
            .history
            .iter()
            .map(|turn| match turn.role {
                Role::Caller => ChatMessage::user_text(labelled(request.caller_label, &turn.content)),
                Role::Assistant => ChatMessage::assistant_text(turn.content.clone()),
            })
            .collect();
        messages.push(ChatMessage::user_text(labelled(
            request.caller_label,
            request.text,
        )));
        messages
    }

    /// Run the first requested tool and answer every `tool_use` block.
    async fn tool_results(&self, content: &[ContentBlock]) -> Vec<ContentBlock> {
        let mut results = Vec::new();
        let mut executed = false;
        for block in content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            if executed {
                warn!("🔧 Skipping extra tool call {} ({})", name, id);
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: TOOL_NOT_EXECUTED.to_string(),
                    is_error: true,
                });
                continue;
            }
            executed = true;
            let output = self.tools.execute(name, input).await;
            results.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: output,
                is_error: false,
            });
        }
        results
    }
}

fn labelled(label: &str, text: &str) -> String {
    format!("[{} on phone]: {}", label, text)
}

#[async_trait]
impl ResponseGateway for DirectInferenceClient {
    async fn respond(&self, request: ResponseRequest<'_>) -> VoiceResult<Reply> {
        let started = Instant::now();
        let mut inference = InferenceRequest {
            system: self.system_prompt(),
            max_tokens: self.max_tokens,
            tools: self.tools.specs(),
            messages: Self::messages_for(&request),
        };
        debug!("🧠 Calling model with: \"{}\"", request.text);

        let mut response = self.provider.complete(&inference).await?;

        if response.wants_tool() {
            let results = self.tool_results(&response.content).await;
            let echoed: Vec<ContentBlock> = response
                .content
                .iter()
                .filter(|b| !matches!(b, ContentBlock::Unsupported))
                .cloned()
                .collect();
            inference.messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: echoed,
            });
            inference.messages.push(ChatMessage {
                role: ChatRole::User,
                content: results,
            });
            response = self.provider.complete(&inference).await?;
            if response.wants_tool() {
                warn!("🔧 Follow-up asked for another tool; not honoured");
            }
        }

        let text = response
            .text()
            .ok_or_else(|| VoiceError::Generation("reply contained no text".to_string()))?
            .to_string();
        info!(
            "🧠 Reply in {}ms: \"{}\"",
            started.elapsed().as_millis(),
            text
        );
        Ok(Reply::extending(request.history, request.text, text))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ConversationTurn;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<InferenceResponse>>,
        seen: Mutex<Vec<InferenceRequest>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<InferenceResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        async fn complete(&self, request: &InferenceRequest) -> VoiceResult<InferenceResponse> {
            self.seen.lock().push(request.clone());
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| VoiceError::Generation("no scripted reply".into()))
        }
    }

    fn text_reply(text: &str) -> InferenceResponse {
        InferenceResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: Some("end_turn".into()),
        }
    }

    fn client(provider: Arc<ScriptedProvider>) -> DirectInferenceClient {
        let config = DirectConfig::default();
        let tools = ToolRegistry::phone_defaults(
            config.offset().unwrap(),
            "Dubai",
            "http://127.0.0.1:9",
            "Dubai",
        );
        DirectInferenceClient::new(provider, tools, &config).unwrap()
    }

    fn request<'a>(text: &'a str, history: &'a [ConversationTurn]) -> ResponseRequest<'a> {
        ResponseRequest {
            request_id: "req-1",
            caller_id: "+971500000000",
            caller_label: "JV",
            text,
            history,
        }
    }

    #[test]
    fn content_blocks_use_the_messages_api_shape() {
        let raw = r#"{"content":[
            {"type":"text","text":"Let me check."},
            {"type":"tool_use","id":"tu_1","name":"get_time","input":{}},
            {"type":"thinking","thinking":"hmm"}
        ],"stop_reason":"tool_use"}"#;
        let parsed: InferenceResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.wants_tool());
        assert_eq!(parsed.content[2], ContentBlock::Unsupported);

        let result = ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "noon".into(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"type":"tool_result","tool_use_id":"tu_1","content":"noon"})
        );
    }

    #[tokio::test]
    async fn plain_reply_extends_history() {
        let provider = ScriptedProvider::new(vec![text_reply("Hey JV!")]);
        let history = vec![
            ConversationTurn::caller("hello"),
            ConversationTurn::assistant("Hi there."),
        ];
        let reply = client(provider.clone())
            .respond(request("you there?", &history))
            .await
            .unwrap();

        assert_eq!(reply.text, "Hey JV!");
        assert_eq!(reply.history.len(), 4);

        let seen = provider.seen.lock();
        assert_eq!(seen.len(), 1);
        let sent = &seen[0];
        assert_eq!(sent.max_tokens, 150);
        assert!(!sent.system.contains(TIME_PLACEHOLDER));
        assert_eq!(
            sent.messages[0],
            ChatMessage::user_text("[JV on phone]: hello")
        );
        assert_eq!(
            sent.messages.last().unwrap(),
            &ChatMessage::user_text("[JV on phone]: you there?")
        );
    }

    #[tokio::test]
    async fn one_tool_then_one_follow_up() {
        let first = InferenceResponse {
            content: vec![
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "get_time".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "tu_2".into(),
                    name: "get_weather".into(),
                    input: serde_json::json!({"location": "Dubai"}),
                },
            ],
            stop_reason: Some("tool_use".into()),
        };
        // The follow-up asks for yet another tool, alongside its text.
        let second = InferenceResponse {
            content: vec![
                ContentBlock::Text {
                    text: "It's just past three.".into(),
                },
                ContentBlock::ToolUse {
                    id: "tu_3".into(),
                    name: "get_weather".into(),
                    input: serde_json::json!({}),
                },
            ],
            stop_reason: Some("tool_use".into()),
        };
        let provider = ScriptedProvider::new(vec![first, second]);
        let reply = client(provider.clone())
            .respond(request("what time is it", &[]))
            .await
            .unwrap();

        assert_eq!(reply.text, "It's just past three.");

        let seen = provider.seen.lock();
        assert_eq!(seen.len(), 2, "exactly one follow-up call");
        let follow_up = &seen[1].messages;
        assert_eq!(follow_up[1].role, ChatRole::Assistant);
        let ChatMessage { role, content } = &follow_up[2];
        assert_eq!(*role, ChatRole::User);
        match (&content[0], &content[1]) {
            (
                ContentBlock::ToolResult {
                    tool_use_id: first_id,
                    is_error: false,
                    content: time,
                },
                ContentBlock::ToolResult {
                    tool_use_id: second_id,
                    is_error: true,
                    content: skipped,
                },
            ) => {
                assert_eq!(first_id, "tu_1");
                assert!(!time.is_empty());
                assert_eq!(second_id, "tu_2");
                assert_eq!(skipped, TOOL_NOT_EXECUTED);
            }
            other => panic!("unexpected tool results: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_leaves_history_to_the_caller() {
        let provider = ScriptedProvider::new(vec![]);
        let history = vec![ConversationTurn::caller("hi")];
        let err = client(provider)
            .respond(request("again", &history))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Generation(_)));
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn reply_without_text_is_a_generation_failure() {
        let provider = ScriptedProvider::new(vec![InferenceResponse {
            content: vec![],
            stop_reason: Some("end_turn".into()),
        }]);
        let err = client(provider).respond(request("hm", &[])).await.unwrap_err();
        assert!(matches!(err, VoiceError::Generation(_)));
    }
}
