//! Static provider and model metadata served by `GET /api/config`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tools::ToolVersion;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    Bedrock,
    Vertex,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::Bedrock, Provider::Vertex];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
            Self::Vertex => "vertex",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => DEFAULT_MODEL,
            Self::Bedrock => "anthropic.claude-3-5-sonnet-20241022-v2:0",
            Self::Vertex => "claude-3-5-sonnet-v2@20241022",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub tool_version: ToolVersion,
    pub max_output_tokens: u32,
    pub default_output_tokens: u32,
    pub has_thinking: bool,
}

const fn model(
    tool_version: ToolVersion,
    max_output_tokens: u32,
    default_output_tokens: u32,
    has_thinking: bool,
) -> ModelConfig {
    ModelConfig {
        tool_version,
        max_output_tokens,
        default_output_tokens,
        has_thinking,
    }
}

const MODELS: &[(&str, ModelConfig)] = &[
    ("claude-opus-4-1-20250805", model(ToolVersion::V20250429, 64_000, 16_384, true)),
    ("claude-sonnet-4-20250514", model(ToolVersion::V20250429, 64_000, 16_384, true)),
    ("claude-opus-4-20250514", model(ToolVersion::V20250429, 64_000, 16_384, true)),
    ("claude-sonnet-4-5-20250929", model(ToolVersion::V20250124, 128_000, 16_384, true)),
    ("claude-haiku-4-5-20251001", model(ToolVersion::V20250124, 8_192, 4_096, false)),
    ("claude-opus-4-5-20251101", model(ToolVersion::V20251124, 64_000, 16_384, true)),
];

/// Response body of `GET /api/config`.
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub providers: Vec<Provider>,
    pub default_models: BTreeMap<Provider, &'static str>,
    pub tool_versions: Vec<ToolVersion>,
    pub model_configs: BTreeMap<&'static str, ModelConfig>,
}

pub fn config_response() -> ConfigResponse {
    ConfigResponse {
        providers: Provider::ALL.to_vec(),
        default_models: Provider::ALL
            .iter()
            .map(|p| (*p, p.default_model()))
            .collect(),
        tool_versions: ToolVersion::ALL.to_vec(),
        model_configs: MODELS.iter().map(|(id, c)| (*id, c.clone())).collect(),
    }
}
