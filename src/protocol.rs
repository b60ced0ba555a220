use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::RunConfig;
use crate::ai_sdk::{ContentBlock, MessageParam, Role};
use crate::catalog::{DEFAULT_MODEL, Provider};
use crate::tools::{ToolResult, ToolVersion};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<ChatMessage> for MessageParam {
    fn from(message: ChatMessage) -> Self {
        let content = match message.content {
            MessageContent::Text(text) => vec![ContentBlock::text(text)],
            MessageContent::Blocks(blocks) => blocks,
        };
        MessageParam {
            role: message.role,
            content,
        }
    }
}

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt_suffix: String,
    #[serde(default = "default_image_retention")]
    pub only_n_most_recent_images: Option<usize>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub tool_version: ToolVersion,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub token_efficient_tools_beta: bool,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_image_retention() -> Option<usize> {
    Some(3)
}

fn default_max_tokens() -> u32 {
    16_384
}

impl ChatRequest {
    pub fn into_run(self) -> (Vec<MessageParam>, RunConfig) {
        let messages = self.messages.into_iter().map(MessageParam::from).collect();
        let config = RunConfig {
            model: self.model,
            provider: self.provider,
            api_key: self.api_key,
            system_prompt_suffix: self.system_prompt_suffix,
            only_n_most_recent_images: self.only_n_most_recent_images,
            max_tokens: self.max_tokens,
            tool_version: self.tool_version,
            thinking_budget: self.thinking_budget,
            token_efficient_tools_beta: self.token_efficient_tools_beta,
        };
        (messages, config)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthValidateRequest {
    pub provider: Provider,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthValidateResponse {
    pub valid: bool,
    pub error: Option<String>,
}

impl AuthValidateResponse {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiKeyStatus {
    pub has_key: bool,
    pub masked_key: Option<String>,
}

/// One observable occurrence during an agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_id: String,
        output: Option<String>,
        error: Option<String>,
        image_data: Option<String>,
        system_note: Option<String>,
    },
    HttpLog {
        method: String,
        url: String,
        status_code: Option<u16>,
        error: Option<String>,
    },
    Done {
        final_messages: Vec<MessageParam>,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl StreamEvent {
    pub fn tool_result(tool_id: impl Into<String>, result: ToolResult) -> Self {
        Self::ToolResult {
            tool_id: tool_id.into(),
            output: result.output,
            error: result.error,
            image_data: result.base64_image,
            system_note: result.system,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::HttpLog { .. } => "http_log",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// JSON payload carried in the SSE `data` field.
    pub fn payload(&self) -> Value {
        match self {
            Self::Message { text } => json!({"type": "text", "text": text}),
            Self::Thinking { text } => json!({"thinking": text}),
            Self::ToolUse { id, name, input } => json!({"id": id, "name": name, "input": input}),
            Self::ToolResult {
                tool_id,
                output,
                error,
                image_data,
                system_note,
            } => json!({
                "tool_id": tool_id,
                "output": output,
                "error": error,
                "base64_image": image_data,
                "system": system_note,
            }),
            Self::HttpLog {
                method,
                url,
                status_code,
                error,
            } => {
                let mut log = json!({"request": {"method": method, "url": url}});
                if let Some(status) = status_code {
                    log["response"] = json!({"status_code": status});
                }
                if let Some(error) = error {
                    log["error"] = json!(error);
                }
                log
            }
            Self::Done { final_messages } => json!({"messages": final_messages}),
            Self::Error { message, kind } => json!({"error": message, "type": kind}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_applies_defaults() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "open firefox"}]
        }))
        .unwrap();
        let (messages, config) = request.into_run();

        assert_eq!(messages, vec![MessageParam::user_text("open firefox")]);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.provider, Provider::Anthropic);
        assert_eq!(config.only_n_most_recent_images, Some(3));
        assert_eq!(config.max_tokens, 16_384);
        assert_eq!(config.tool_version, ToolVersion::V20250124);
        assert_eq!(config.thinking_budget, None);
        assert!(!config.token_efficient_tools_beta);
    }

    #[test]
    fn chat_request_keeps_block_content() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "clicking"},
                    {"type": "tool_use", "id": "t1", "name": "computer", "input": {"action": "left_click"}}
                ]}
            ],
            "provider": "bedrock",
            "only_n_most_recent_images": null,
            "tool_version": "computer_use_20250429"
        }))
        .unwrap();
        let (messages, config) = request.into_run();

        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content.len(), 2);
        assert_eq!(config.provider, Provider::Bedrock);
        assert_eq!(config.only_n_most_recent_images, None);
        assert_eq!(config.tool_version, ToolVersion::V20250429);
    }

    #[test]
    fn unmodelled_client_blocks_reach_the_done_payload() {
        let document = json!({
            "type": "document",
            "source": {"type": "base64", "media_type": "application/pdf", "data": "JVBERi0x"}
        });
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "summarize"},
                document.clone()
            ]}]
        }))
        .unwrap();
        let (messages, _) = request.into_run();

        let payload = StreamEvent::Done {
            final_messages: messages,
        }
        .payload();
        assert_eq!(payload["messages"][0]["content"][0]["text"], "summarize");
        assert_eq!(payload["messages"][0]["content"][1], document);
    }

    #[test]
    fn every_variant_maps_to_its_wire_name_and_payload() {
        let cases = vec![
            (
                StreamEvent::Message { text: "Hello".into() },
                "message",
                json!({"type": "text", "text": "Hello"}),
            ),
            (
                StreamEvent::Thinking { text: "plan".into() },
                "thinking",
                json!({"thinking": "plan"}),
            ),
            (
                StreamEvent::ToolUse {
                    id: "t1".into(),
                    name: "computer".into(),
                    input: json!({"action": "screenshot"}),
                },
                "tool_use",
                json!({"id": "t1", "name": "computer", "input": {"action": "screenshot"}}),
            ),
            (
                StreamEvent::tool_result("t1", ToolResult::error("display not found")),
                "tool_result",
                json!({
                    "tool_id": "t1",
                    "output": null,
                    "error": "display not found",
                    "base64_image": null,
                    "system": null
                }),
            ),
            (
                StreamEvent::HttpLog {
                    method: "POST".into(),
                    url: "https://api.anthropic.com/v1/messages".into(),
                    status_code: Some(200),
                    error: None,
                },
                "http_log",
                json!({
                    "request": {"method": "POST", "url": "https://api.anthropic.com/v1/messages"},
                    "response": {"status_code": 200}
                }),
            ),
            (
                StreamEvent::Done {
                    final_messages: vec![MessageParam::user_text("hi")],
                },
                "done",
                json!({"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]}),
            ),
            (
                StreamEvent::Error {
                    message: "boom".into(),
                    kind: "api_error".into(),
                },
                "error",
                json!({"error": "boom", "type": "api_error"}),
            ),
        ];

        for (event, name, payload) in cases {
            assert_eq!(event.name(), name);
            assert_eq!(event.payload(), payload, "payload for {name}");
            assert_eq!(event.is_terminal(), name == "done" || name == "error");
        }
    }

    #[test]
    fn failed_http_log_omits_response() {
        let event = StreamEvent::HttpLog {
            method: "POST".into(),
            url: "http://upstream".into(),
            status_code: None,
            error: Some("connection refused".into()),
        };
        assert_eq!(
            event.payload(),
            json!({
                "request": {"method": "POST", "url": "http://upstream"},
                "error": "connection refused"
            })
        );
    }
}
