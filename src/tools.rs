use crate::ai_sdk::{ContentBlock, ToolResultContent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod bash;
mod computer;
mod edit;

pub use computer::DisplaySettings;

use bash::BashTool;
use computer::ComputerTool;
use edit::EditTool;

/// Which generation of Anthropic's computer-use tools to advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolVersion {
    #[serde(rename = "computer_use_20241022")]
    V20241022,
    #[default]
    #[serde(rename = "computer_use_20250124")]
    V20250124,
    #[serde(rename = "computer_use_20250429")]
    V20250429,
    #[serde(rename = "computer_use_20251124")]
    V20251124,
}

impl ToolVersion {
    pub const ALL: [ToolVersion; 4] = [
        ToolVersion::V20241022,
        ToolVersion::V20250124,
        ToolVersion::V20250429,
        ToolVersion::V20251124,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V20241022 => "computer_use_20241022",
            Self::V20250124 => "computer_use_20250124",
            Self::V20250429 => "computer_use_20250429",
            Self::V20251124 => "computer_use_20251124",
        }
    }

    /// Value for the `anthropic-beta` header.
    pub fn beta_flag(self) -> &'static str {
        match self {
            Self::V20241022 => "computer-use-2024-10-22",
            Self::V20250124 | Self::V20250429 => "computer-use-2025-01-24",
            Self::V20251124 => "computer-use-2025-11-24",
        }
    }

    fn computer_type(self) -> &'static str {
        match self {
            Self::V20241022 => "computer_20241022",
            Self::V20250124 | Self::V20250429 => "computer_20250124",
            Self::V20251124 => "computer_20251124",
        }
    }

    fn bash_type(self) -> &'static str {
        match self {
            Self::V20241022 => "bash_20241022",
            _ => "bash_20250124",
        }
    }

    fn editor_type(self) -> &'static str {
        match self {
            Self::V20241022 => "text_editor_20241022",
            Self::V20250124 => "text_editor_20250124",
            Self::V20250429 => "text_editor_20250429",
            Self::V20251124 => "text_editor_20250728",
        }
    }

    fn editor_name(self) -> &'static str {
        match self {
            Self::V20241022 | Self::V20250124 => "str_replace_editor",
            Self::V20250429 | Self::V20251124 => "str_replace_based_edit_tool",
        }
    }
}

/// Outcome of one tool invocation. A populated `error` is data, not a failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub base64_image: Option<String>,
    pub system: Option<String>,
}

impl ToolResult {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, base64_png: String) -> Self {
        self.base64_image = Some(base64_png);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Convert into the `tool_result` block sent back to the model.
    pub(crate) fn to_content_block(&self, tool_use_id: &str) -> ContentBlock {
        let mut content = Vec::new();
        let text = if self.is_error() {
            self.error.as_deref()
        } else {
            self.output.as_deref()
        };
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            let text = match &self.system {
                Some(system) => format!("<system>{system}</system>\n{text}"),
                None => text.to_string(),
            };
            content.push(ContentBlock::text(text));
        }
        if let Some(image) = &self.base64_image {
            content.push(ContentBlock::png(image.clone()));
        }

        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: ToolResultContent::Blocks(content),
            is_error: self.is_error().then_some(true),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::error(err.to_string())
    }
}

/// The tools available to one run.
pub struct ToolCollection {
    version: ToolVersion,
    computer: ComputerTool,
    bash: BashTool,
    editor: EditTool,
}

impl ToolCollection {
    pub fn new(version: ToolVersion, display: DisplaySettings) -> Self {
        Self {
            version,
            computer: ComputerTool::new(version, display),
            bash: BashTool::new(),
            editor: EditTool::new(),
        }
    }

    /// Tool parameters for the Messages API request.
    pub fn api_specs(&self) -> Vec<serde_json::Value> {
        vec![
            self.computer.api_spec(self.version.computer_type()),
            serde_json::json!({"type": self.version.bash_type(), "name": "bash"}),
            serde_json::json!({
                "type": self.version.editor_type(),
                "name": self.version.editor_name(),
            }),
        ]
    }

    pub async fn run(&self, name: &str, input: serde_json::Value) -> ToolResult {
        let result = match name {
            "computer" => self.computer.run(input).await,
            "bash" => self.bash.run(input).await,
            n if n == self.version.editor_name() => self.editor.run(input).await,
            other => Err(ToolError::InvalidInput(format!("Tool {other} is invalid"))),
        };
        result.unwrap_or_else(ToolResult::from)
    }
}

/// Cut `s` to at most `max_bytes` without splitting a character.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    &s[..cutoff]
}
