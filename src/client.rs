use clap::Args;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use std::future::Future;
use thiserror::Error;

use crate::catalog::DEFAULT_MODEL;

/// Options for `cua-bridge chat`.
#[derive(Debug, Clone, Args)]
pub struct ChatArgs {
    /// Prompt sent as a single user message
    pub prompt: String,

    /// Base URL of a running cua-bridge server
    #[arg(long, env = "CUA_BRIDGE_URL", default_value = "http://localhost:8000")]
    pub url: String,

    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Overrides the server's ANTHROPIC_API_KEY
    #[arg(long)]
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One server-sent event as seen on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

impl SseFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self.event.as_str(), "done" | "error")
    }
}

/// POST one prompt to `/api/chat/stream` and hand every event to `on_frame`
/// until the terminal event arrives or the server closes the stream.
pub async fn stream_chat<F, Fut>(args: &ChatArgs, mut on_frame: F) -> Result<(), ClientError>
where
    F: FnMut(SseFrame) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut body = json!({
        "messages": [{"role": "user", "content": args.prompt}],
        "model": args.model,
    });
    if let Some(key) = &args.api_key {
        body["api_key"] = json!(key);
    }

    let response = HttpClient::new()
        .post(format!("{}/api/chat/stream", args.url.trim_end_matches('/')))
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

        while let Some(idx) = buffer.find("\n\n") {
            let raw = buffer[..idx].to_string();
            buffer.drain(..idx + 2);

            if let Some(frame) = parse_frame(&raw) {
                let terminal = frame.is_terminal();
                on_frame(frame).await;
                if terminal {
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Parse one SSE block. Comment-only blocks (keep-alives) yield `None`.
fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: serde_json::from_str(&data).unwrap_or(Value::String(data)),
    })
}

/// Render a frame as a single terminal line.
pub fn describe(frame: &SseFrame) -> String {
    let data = &frame.data;
    match frame.event.as_str() {
        "message" => data["text"].as_str().unwrap_or_default().to_string(),
        "thinking" => format!("[thinking] {}", data["thinking"].as_str().unwrap_or_default()),
        "tool_use" => format!(
            "[tool_use {}] {} {}",
            data["id"].as_str().unwrap_or_default(),
            data["name"].as_str().unwrap_or_default(),
            data["input"]
        ),
        "tool_result" => {
            let id = data["tool_id"].as_str().unwrap_or_default();
            let mut line = match (data["output"].as_str(), data["error"].as_str()) {
                (_, Some(error)) => format!("[tool_result {id}] error: {error}"),
                (Some(output), None) => format!("[tool_result {id}] {output}"),
                (None, None) => format!("[tool_result {id}]"),
            };
            if data["base64_image"].is_string() {
                line.push_str(" (+screenshot)");
            }
            line
        }
        "http_log" => {
            let method = data["request"]["method"].as_str().unwrap_or_default();
            let url = data["request"]["url"].as_str().unwrap_or_default();
            match data["response"]["status_code"].as_u64() {
                Some(status) => format!("[http] {method} {url} -> {status}"),
                None => format!(
                    "[http] {method} {url} failed: {}",
                    data["error"].as_str().unwrap_or_default()
                ),
            }
        }
        "done" => format!("[done] {} messages", data["messages"].as_array().map_or(0, Vec::len)),
        "error" => format!(
            "[error {}] {}",
            data["type"].as_str().unwrap_or_default(),
            data["error"].as_str().unwrap_or_default()
        ),
        other => format!("[{other}] {data}"),
    }
}
