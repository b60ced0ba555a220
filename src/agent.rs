use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::ai_sdk::{
    ContentBlock, MessageParam, MessageRequest, MessageResponse, ThinkingConfig,
    retain_recent_images,
};
use crate::catalog::Provider;
use crate::error::AgentError;
use crate::tools::{DisplaySettings, ToolCollection, ToolResult, ToolVersion};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TOKEN_EFFICIENT_TOOLS_BETA: &str = "token-efficient-tools-2025-02-19";

/// Per-run settings taken from the chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub model: String,
    pub provider: Provider,
    /// Key supplied by the client; replaced by the resolved key before the run starts.
    pub api_key: Option<String>,
    pub system_prompt_suffix: String,
    pub only_n_most_recent_images: Option<usize>,
    pub max_tokens: u32,
    pub tool_version: ToolVersion,
    pub thinking_budget: Option<u32>,
    pub token_efficient_tools_beta: bool,
}

/// One upstream HTTP attempt made during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpExchange {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

type OutputFn = dyn Fn(&ContentBlock) + Send + Sync;
type ToolResultFn = dyn Fn(&ToolResult, &str) + Send + Sync;
type HttpFn = dyn Fn(&HttpExchange) + Send + Sync;

/// Notifications an agent loop delivers while it runs. Handlers are called
/// synchronously and must not block.
pub struct RunCallbacks {
    on_output: Box<OutputFn>,
    on_tool_result: Box<ToolResultFn>,
    on_http: Box<HttpFn>,
}

impl RunCallbacks {
    pub fn new(
        on_output: impl Fn(&ContentBlock) + Send + Sync + 'static,
        on_tool_result: impl Fn(&ToolResult, &str) + Send + Sync + 'static,
        on_http: impl Fn(&HttpExchange) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_output: Box::new(on_output),
            on_tool_result: Box::new(on_tool_result),
            on_http: Box::new(on_http),
        }
    }

    pub fn output(&self, block: &ContentBlock) {
        (self.on_output)(block)
    }

    pub fn tool_result(&self, result: &ToolResult, tool_id: &str) {
        (self.on_tool_result)(result, tool_id)
    }

    pub fn http(&self, exchange: &HttpExchange) {
        (self.on_http)(exchange)
    }
}

/// An agent execution loop: runs the conversation to completion, reporting
/// progress through `callbacks`, and returns the full transcript.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    async fn run(
        &self,
        messages: Vec<MessageParam>,
        config: &RunConfig,
        callbacks: &RunCallbacks,
    ) -> Result<Vec<MessageParam>, AgentError>;
}

/// Agent loop backed by the Anthropic Messages API and the computer-use tools.
pub struct SamplingLoop {
    client: Client,
    base_url: String,
    display: DisplaySettings,
}

impl SamplingLoop {
    pub fn new(display: DisplaySettings) -> Self {
        Self {
            client: Client::new(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            display,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn run_inference(
        &self,
        api_key: &str,
        betas: &[&str],
        request: &MessageRequest<'_>,
        callbacks: &RunCallbacks,
    ) -> Result<MessageResponse, AgentError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut exchange = HttpExchange {
            method: "POST".to_string(),
            url: url.clone(),
            status: None,
            error: None,
        };

        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        if !betas.is_empty() {
            builder = builder.header("anthropic-beta", betas.join(","));
        }

        let response = match builder.json(request).send().await {
            Ok(response) => response,
            Err(err) => {
                exchange.error = Some(err.to_string());
                callbacks.http(&exchange);
                return Err(err.into());
            }
        };

        let status = response.status();
        exchange.status = Some(status.as_u16());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            exchange.error = Some(format!("{status}: {body}"));
            callbacks.http(&exchange);
            return Err(AgentError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        callbacks.http(&exchange);

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl AgentLoop for SamplingLoop {
    async fn run(
        &self,
        messages: Vec<MessageParam>,
        config: &RunConfig,
        callbacks: &RunCallbacks,
    ) -> Result<Vec<MessageParam>, AgentError> {
        if config.provider != Provider::Anthropic {
            return Err(AgentError::UnsupportedProvider(config.provider.to_string()));
        }
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AgentError::MissingCredential {
                provider: config.provider.to_string(),
            })?;
        if matches!(config.thinking_budget, Some(budget) if budget >= config.max_tokens) {
            return Err(AgentError::Configuration(
                "thinking_budget must be less than max_tokens".to_string(),
            ));
        }

        let tools = ToolCollection::new(config.tool_version, self.display);
        let mut betas = vec![config.tool_version.beta_flag()];
        if config.token_efficient_tools_beta {
            betas.push(TOKEN_EFFICIENT_TOOLS_BETA);
        }
        let system = system_prompt(&config.system_prompt_suffix);

        let mut messages = messages;
        loop {
            if let Some(keep) = config.only_n_most_recent_images {
                retain_recent_images(&mut messages, keep);
            }

            let request = MessageRequest {
                model: &config.model,
                max_tokens: config.max_tokens,
                system: system.clone(),
                messages: &messages,
                tools: tools.api_specs(),
                thinking: config.thinking_budget.map(ThinkingConfig::enabled),
            };
            let response = self
                .run_inference(api_key, &betas, &request, callbacks)
                .await?;
            debug!(
                message_id = %response.id,
                stop_reason = ?response.stop_reason,
                blocks = response.content.len(),
                "model responded"
            );

            let mut tool_results = Vec::new();
            for block in &response.content {
                callbacks.output(block);
                if let ContentBlock::ToolUse { id, name, input } = block {
                    let result = tools.run(name, input.clone()).await;
                    if let Some(error) = &result.error {
                        warn!(tool = %name, %error, "tool reported an error");
                    }
                    callbacks.tool_result(&result, id);
                    tool_results.push(result.to_content_block(id));
                }
            }

            messages.push(MessageParam::assistant(response.content));
            if tool_results.is_empty() {
                return Ok(messages);
            }
            messages.push(MessageParam::user(tool_results));
        }
    }
}

fn system_prompt(suffix: &str) -> String {
    let today = chrono::Local::now().format("%A, %B %-d, %Y");
    let mut prompt = format!(
        "<SYSTEM_CAPABILITY>\n\
         * You are operating an Ubuntu virtual machine through the computer, bash and editor tools.\n\
         * GUI applications started from bash need DISPLAY set; start them in the background.\n\
         * Prefer commands that write long output to a file you can page through with the editor.\n\
         * Take a screenshot after each GUI action to confirm its effect before moving on.\n\
         * The current date is {today}.\n\
         </SYSTEM_CAPABILITY>"
    );
    if !suffix.is_empty() {
        prompt.push(' ');
        prompt.push_str(suffix);
    }
    prompt
}
