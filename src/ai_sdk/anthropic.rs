use serde::{Deserialize, Serialize};

/// Screenshots are dropped in chunks of this size so the cached prompt prefix
/// is only invalidated every few turns.
const IMAGE_REMOVAL_CHUNK: usize = 10;

#[derive(Debug, Serialize)]
pub(crate) struct MessageRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) max_tokens: u32,
    pub(crate) system: String,
    pub(crate) messages: &'a [MessageParam],
    pub(crate) tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ThinkingConfig {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) budget_tokens: u32,
}

impl ThinkingConfig {
    pub(crate) fn enabled(budget_tokens: u32) -> Self {
        Self {
            kind: "enabled",
            budget_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl MessageParam {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: ImageSource,
    },
    /// Any other block type (documents, server tool use, search results),
    /// kept verbatim so it round-trips through the transcript.
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn png(data: String) -> Self {
        Self::Image {
            source: ImageSource::base64_png(data),
        }
    }
}

/// Tool result bodies arrive either as a bare string or as a block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64_png(data: String) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: "image/png".to_string(),
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) id: String,
    pub(crate) content: Vec<ContentBlock>,
    #[serde(default)]
    pub(crate) stop_reason: Option<String>,
}

/// Drop all but the `keep` most recent images found inside tool results.
///
/// The number removed is rounded down to a multiple of the removal chunk.
pub(crate) fn retain_recent_images(messages: &mut [MessageParam], keep: usize) {
    let total: usize = tool_result_blocks(messages)
        .map(|blocks| blocks.iter().filter(|b| is_image(b)).count())
        .sum();

    let mut to_remove = total.saturating_sub(keep);
    to_remove -= to_remove % IMAGE_REMOVAL_CHUNK;
    if to_remove == 0 {
        return;
    }

    for message in messages.iter_mut() {
        for block in message.content.iter_mut() {
            let ContentBlock::ToolResult {
                content: ToolResultContent::Blocks(blocks),
                ..
            } = block
            else {
                continue;
            };
            blocks.retain(|b| {
                if to_remove > 0 && is_image(b) {
                    to_remove -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

fn tool_result_blocks(messages: &[MessageParam]) -> impl Iterator<Item = &Vec<ContentBlock>> {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                content: ToolResultContent::Blocks(blocks),
                ..
            } => Some(blocks),
            _ => None,
        })
}

fn is_image(block: &ContentBlock) -> bool {
    matches!(block, ContentBlock::Image { .. })
}
