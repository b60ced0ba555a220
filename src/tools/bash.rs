use serde::Deserialize;
use std::time::Duration;

use super::{ToolError, ToolResult, truncate_utf8};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_BYTES: usize = 16_000;
const TRUNCATED_NOTICE: &str = "<response clipped><NOTE>To save on context only part of this file has been shown to you.</NOTE>";

#[derive(Debug, Default, Deserialize)]
struct BashInput {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    restart: bool,
}

/// Runs each command in a fresh `bash -c` with a timeout.
pub(super) struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub(super) fn new() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub(super) async fn run(&self, input: serde_json::Value) -> Result<ToolResult, ToolError> {
        let input: BashInput = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidInput(format!("invalid bash input: {e}")))?;

        if input.restart {
            return Ok(ToolResult {
                system: Some("tool has been restarted.".to_string()),
                ..ToolResult::default()
            });
        }

        let command = input
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidInput("no command provided.".to_string()))?;

        tracing::debug!(%command, "running bash command");
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("bash")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ToolError::Timeout(self.timeout))??;

        let stdout = clip(&String::from_utf8_lossy(&output.stdout));
        let stderr = clip(&String::from_utf8_lossy(&output.stderr));

        Ok(ToolResult {
            output: Some(stdout),
            error: (!stderr.is_empty()).then_some(stderr),
            ..ToolResult::default()
        })
    }
}

fn clip(s: &str) -> String {
    let trimmed = s.trim_end_matches('\n');
    if trimmed.len() <= MAX_OUTPUT_BYTES {
        return trimmed.to_string();
    }
    format!("{}{TRUNCATED_NOTICE}", truncate_utf8(trimmed, MAX_OUTPUT_BYTES))
}
