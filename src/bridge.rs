//! Turns one callback-driven agent run into a pull-based, cancellable event stream.
//!
//! [`StreamBridge::start`] spawns the agent loop as a background task whose
//! callbacks push [`StreamEvent`]s into a relay. The returned [`EventStream`]
//! drains that relay and ends after the single terminal event (`Done` or
//! `Error`). Dropping the stream early cancels the task; the task is then
//! awaited by a reaper so it never outlives the request.

use futures::FutureExt;
use futures::Stream;
use futures::stream::FusedStream;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

use crate::agent::{AgentLoop, HttpExchange, RunCallbacks, RunConfig};
use crate::ai_sdk::{ContentBlock, MessageParam};
use crate::credentials::CredentialResolver;
use crate::error::AgentError;
use crate::protocol::StreamEvent;
use crate::relay::{self, RelayReceiver, RelaySender};

/// Lifecycle of one run. Every state but `Running` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Clone)]
pub struct StreamBridge {
    agent: Arc<dyn AgentLoop>,
    credentials: Arc<dyn CredentialResolver>,
}

impl StreamBridge {
    pub fn new(agent: Arc<dyn AgentLoop>, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self { agent, credentials }
    }

    /// Launch one agent run and return its event stream.
    ///
    /// Must be called from within a tokio runtime. Configuration problems are
    /// not checked here; they surface as the stream's terminal `Error` event.
    pub fn start(&self, messages: Vec<MessageParam>, config: RunConfig) -> EventStream {
        let run_id = Uuid::new_v4().to_string();
        let (relay, receiver) = relay::channel();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RunState::Running);

        let span = info_span!(
            "run",
            run_id = %run_id,
            model = %config.model,
            provider = %config.provider
        );
        let run = Run {
            agent: Arc::clone(&self.agent),
            credentials: Arc::clone(&self.credentials),
            relay: relay.clone(),
            cancel: cancel.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(run.drive(messages, config).instrument(span));

        EventStream {
            run_id,
            receiver,
            guard: RunGuard {
                relay,
                cancel,
                task: Some(task),
                state: state_rx,
            },
        }
    }
}

/// Everything the background task owns.
struct Run {
    agent: Arc<dyn AgentLoop>,
    credentials: Arc<dyn CredentialResolver>,
    relay: RelaySender<StreamEvent>,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl Run {
    async fn drive(self, messages: Vec<MessageParam>, mut config: RunConfig) {
        let agent = Arc::clone(&self.agent);
        let credentials = Arc::clone(&self.credentials);
        let callbacks = adapters(&self.relay);

        // Resolver panics are caught the same way as agent panics.
        let run = AssertUnwindSafe(async move {
            let api_key = credentials.resolve(config.provider, config.api_key.as_deref());
            config.api_key = Some(api_key.unwrap_or_default());
            info!(messages = messages.len(), "agent run started");
            agent.run(messages, &config, &callbacks).await
        })
        .catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = run => Some(result.unwrap_or_else(|panic| Err(AgentError::from_panic(panic)))),
        };

        let state = match outcome {
            None => {
                info!("agent run cancelled");
                RunState::Cancelled
            }
            Some(Ok(final_messages)) => {
                info!(messages = final_messages.len(), "agent run completed");
                self.relay.push(StreamEvent::Done { final_messages });
                RunState::Completed
            }
            Some(Err(err)) => {
                warn!(error = %err, kind = err.kind(), "agent run failed");
                self.relay.push(StreamEvent::Error {
                    message: err.to_string(),
                    kind: err.kind().to_string(),
                });
                RunState::Failed
            }
        };
        self.relay.close();
        self.state.send_replace(state);
    }
}

/// Wire the three agent callbacks to the relay.
fn adapters(relay: &RelaySender<StreamEvent>) -> RunCallbacks {
    let output = relay.clone();
    let tool_results = relay.clone();
    let http = relay.clone();
    RunCallbacks::new(
        move |block| {
            if let Some(event) = classify(block) {
                output.push(event);
            }
        },
        move |result, tool_id| {
            tool_results.push(StreamEvent::tool_result(tool_id, result.clone()));
        },
        move |exchange: &HttpExchange| {
            http.push(StreamEvent::HttpLog {
                method: exchange.method.clone(),
                url: exchange.url.clone(),
                status_code: exchange.status,
                error: exchange.error.clone(),
            });
        },
    )
}

/// Map a model content block to its event. Kinds without an event are dropped.
fn classify(block: &ContentBlock) -> Option<StreamEvent> {
    match block {
        ContentBlock::Text { text } => Some(StreamEvent::Message { text: text.clone() }),
        ContentBlock::Thinking { thinking, .. } => Some(StreamEvent::Thinking {
            text: thinking.clone(),
        }),
        ContentBlock::ToolUse { id, name, input } => Some(StreamEvent::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        }),
        other => {
            trace!(block = ?other, "dropping content block without an event");
            None
        }
    }
}

/// Events of one run, in the order the agent produced them.
///
/// Finite and not restartable: yields `None` forever once the terminal event
/// has been delivered.
pub struct EventStream {
    run_id: String,
    receiver: RelayReceiver<StreamEvent>,
    guard: RunGuard,
}

impl EventStream {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        *self.guard.state.borrow()
    }

    /// Watch the run state, e.g. to wait until the task has settled.
    pub fn state_watch(&self) -> watch::Receiver<RunState> {
        self.guard.state.clone()
    }

    /// Stop the run and wait until its task has fully settled.
    pub async fn cancel(mut self) -> RunState {
        self.guard.relay.close();
        self.guard.cancel.cancel();
        if let Some(task) = self.guard.task.take() {
            if let Err(err) = task.await {
                warn!(run_id = %self.run_id, error = %err, "agent task did not settle cleanly");
            }
        }
        self.state()
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_pop(cx)
    }
}

impl FusedStream for EventStream {
    fn is_terminated(&self) -> bool {
        self.receiver.is_ended()
    }
}

/// Tears the run down when the stream goes away.
struct RunGuard {
    relay: RelaySender<StreamEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<RunState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if task.is_finished() {
            return;
        }

        // Nothing can observe events from here on.
        self.relay.close();
        self.cancel.cancel();
        debug!("event stream dropped before the run settled");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = task.await {
                        warn!(error = %err, "abandoned agent task did not settle cleanly");
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Provider;
    use crate::tools::{ToolResult, ToolVersion};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    enum Step {
        Output(ContentBlock),
        ToolResult(&'static str, ToolResult),
        Http(Option<u16>, Option<&'static str>),
        Yield,
        Sleep(Duration),
    }

    enum Ending {
        Finish(Vec<MessageParam>),
        Fail(AgentError),
        Panic,
    }

    /// Replays a fixed script through the callbacks.
    struct ScriptedAgent {
        steps: Vec<Step>,
        ending: Mutex<Option<Ending>>,
        seen_config: Mutex<Option<RunConfig>>,
        resumed: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl ScriptedAgent {
        fn new(steps: Vec<Step>, ending: Ending) -> Self {
            Self {
                steps,
                ending: Mutex::new(Some(ending)),
                seen_config: Mutex::new(None),
                resumed: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AgentLoop for ScriptedAgent {
        async fn run(
            &self,
            _messages: Vec<MessageParam>,
            config: &RunConfig,
            callbacks: &RunCallbacks,
        ) -> Result<Vec<MessageParam>, AgentError> {
            let _flag = DropFlag(self.dropped.clone());
            *self.seen_config.lock().unwrap() = Some(config.clone());

            for step in &self.steps {
                match step {
                    Step::Output(block) => callbacks.output(block),
                    Step::ToolResult(id, result) => callbacks.tool_result(result, id),
                    Step::Http(status, error) => callbacks.http(&HttpExchange {
                        method: "POST".to_string(),
                        url: "https://api.anthropic.com/v1/messages".to_string(),
                        status: *status,
                        error: error.map(str::to_string),
                    }),
                    Step::Yield => tokio::task::yield_now().await,
                    Step::Sleep(duration) => {
                        tokio::time::sleep(*duration).await;
                        self.resumed.store(true, Ordering::SeqCst);
                    }
                }
            }

            let ending = self.ending.lock().unwrap().take();
            match ending {
                Some(Ending::Finish(messages)) => Ok(messages),
                Some(Ending::Fail(err)) => Err(err),
                Some(Ending::Panic) => panic!("scripted panic"),
                None => Err(AgentError::Other("script already consumed".to_string())),
            }
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            model: "claude-sonnet-4-5-20250929".to_string(),
            provider: Provider::Anthropic,
            api_key: None,
            system_prompt_suffix: String::new(),
            only_n_most_recent_images: Some(3),
            max_tokens: 16_384,
            tool_version: ToolVersion::V20250124,
            thinking_budget: None,
            token_efficient_tools_beta: false,
        }
    }

    fn bridge_for(agent: Arc<ScriptedAgent>) -> StreamBridge {
        let resolver = |_: Provider, supplied: Option<&str>| supplied.map(str::to_string);
        StreamBridge::new(agent, Arc::new(resolver))
    }

    async fn run_script(steps: Vec<Step>, ending: Ending) -> Vec<StreamEvent> {
        let agent = Arc::new(ScriptedAgent::new(steps, ending));
        let stream = bridge_for(agent).start(vec![MessageParam::user_text("hi")], config());
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("stream did not finish")
    }

    fn tool_use(id: &str, name: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({"action": name}),
        }
    }

    fn assert_single_terminal_last(events: &[StreamEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "events: {events:?}");
        assert!(events.last().is_some_and(StreamEvent::is_terminal));
    }

    fn assert_tool_results_paired(events: &[StreamEvent]) {
        let mut requested = HashSet::new();
        for event in events {
            match event {
                StreamEvent::ToolUse { id, .. } => {
                    requested.insert(id.clone());
                }
                StreamEvent::ToolResult { tool_id, .. } => {
                    assert!(requested.contains(tool_id), "unpaired tool result {tool_id}");
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn text_then_done() {
        let final_messages = vec![
            MessageParam::user_text("hi"),
            MessageParam::assistant(vec![ContentBlock::text("Hello")]),
        ];
        let events = run_script(
            vec![Step::Output(ContentBlock::text("Hello"))],
            Ending::Finish(final_messages.clone()),
        )
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Message {
                    text: "Hello".to_string()
                },
                StreamEvent::Done { final_messages },
            ]
        );
    }

    #[tokio::test]
    async fn failed_tool_then_agent_failure() {
        let events = run_script(
            vec![
                Step::Output(tool_use("t1", "screenshot")),
                Step::ToolResult("t1", ToolResult::error("display not found")),
            ],
            Ending::Fail(AgentError::Other("sampling aborted".to_string())),
        )
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::ToolUse { id, name, .. } if id == "t1" && name == "screenshot"));
        assert!(matches!(
            &events[1],
            StreamEvent::ToolResult { tool_id, output: None, error: Some(error), .. }
                if tool_id == "t1" && error == "display not found"
        ));
        assert_eq!(
            events[2],
            StreamEvent::Error {
                message: "sampling aborted".to_string(),
                kind: "internal_error".to_string(),
            }
        );
        assert_tool_results_paired(&events);
    }

    #[tokio::test]
    async fn http_logs_are_relayed_for_success_and_failure() {
        let events = run_script(
            vec![
                Step::Http(Some(200), None),
                Step::Yield,
                Step::Http(None, Some("connection reset")),
            ],
            Ending::Finish(Vec::new()),
        )
        .await;

        assert_eq!(events.len(), 3);
        for event in &events[..2] {
            match event {
                StreamEvent::HttpLog { method, url, .. } => {
                    assert_eq!(method, "POST");
                    assert_eq!(url, "https://api.anthropic.com/v1/messages");
                }
                other => panic!("expected http log, got {other:?}"),
            }
        }
        assert!(matches!(&events[0], StreamEvent::HttpLog { status_code: Some(200), error: None, .. }));
        assert!(matches!(&events[1], StreamEvent::HttpLog { status_code: None, error: Some(_), .. }));
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn replays_adapter_pushes_in_exact_order() {
        let events = run_script(
            vec![
                Step::Http(Some(200), None),
                Step::Output(ContentBlock::Thinking {
                    thinking: "look first".to_string(),
                    signature: None,
                }),
                Step::Output(ContentBlock::text("taking a screenshot")),
                Step::Yield,
                Step::Output(tool_use("t1", "screenshot")),
                Step::ToolResult("t1", ToolResult::output("ok")),
                Step::Http(Some(200), None),
                Step::Output(tool_use("t2", "key")),
                Step::Yield,
                Step::ToolResult("t2", ToolResult::output("pressed")),
                Step::Output(ContentBlock::text("done")),
            ],
            Ending::Finish(Vec::new()),
        )
        .await;

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(
            names,
            [
                "http_log",
                "thinking",
                "message",
                "tool_use",
                "tool_result",
                "http_log",
                "tool_use",
                "tool_result",
                "message",
                "done"
            ]
        );
        assert_single_terminal_last(&events);
        assert_tool_results_paired(&events);
    }

    #[tokio::test]
    async fn unmodelled_content_kinds_emit_nothing_but_stay_in_transcript() {
        let document = json!({"type": "document", "source": {"type": "text", "data": "notes"}});
        let final_messages = vec![MessageParam::user(vec![
            ContentBlock::text("summarize"),
            ContentBlock::Other(document.clone()),
        ])];
        let events = run_script(
            vec![
                Step::Output(ContentBlock::Other(json!({"type": "server_tool_use", "id": "s1"}))),
                Step::Output(ContentBlock::RedactedThinking {
                    data: "opaque".to_string(),
                }),
                Step::Output(ContentBlock::png("AAAA".to_string())),
            ],
            Ending::Finish(final_messages),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload()["messages"][0]["content"][1], document);
    }

    #[tokio::test]
    async fn panics_become_error_events() {
        let events = run_script(
            vec![Step::Output(ContentBlock::text("about to fail"))],
            Ending::Panic,
        )
        .await;

        assert_single_terminal_last(&events);
        match events.last() {
            Some(StreamEvent::Error { message, kind }) => {
                assert_eq!(kind, "panic");
                assert!(message.contains("scripted panic"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_ending_yields_exactly_one_terminal_event() {
        for ending in [
            Ending::Finish(Vec::new()),
            Ending::Fail(AgentError::Api {
                status: 500,
                message: "boom".to_string(),
            }),
            Ending::Panic,
        ] {
            let events = run_script(
                vec![
                    Step::Output(ContentBlock::text("a")),
                    Step::Yield,
                    Step::Http(Some(200), None),
                ],
                ending,
            )
            .await;
            assert_single_terminal_last(&events);
        }
    }

    #[tokio::test]
    async fn stream_is_fused_and_reports_completion() {
        let agent = Arc::new(ScriptedAgent::new(
            vec![Step::Output(ContentBlock::text("x"))],
            Ending::Finish(Vec::new()),
        ));
        let mut stream = bridge_for(agent).start(Vec::new(), config());
        let mut state = stream.state_watch();

        while stream.next().await.is_some() {}
        assert!(stream.is_terminated());
        assert_eq!(stream.next().await, None);

        let settled = tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .map(|s| *s)
            .unwrap();
        assert_eq!(settled, RunState::Completed);
    }

    #[tokio::test]
    async fn failed_runs_settle_as_failed() {
        let agent = Arc::new(ScriptedAgent::new(
            Vec::new(),
            Ending::Fail(AgentError::Other("nope".to_string())),
        ));
        let stream = bridge_for(agent).start(Vec::new(), config());
        let mut state = stream.state_watch();
        let _ = stream.collect::<Vec<_>>().await;

        let settled = state.wait_for(|s| s.is_terminal()).await.map(|s| *s).unwrap();
        assert_eq!(settled, RunState::Failed);
    }

    #[tokio::test]
    async fn credentials_are_resolved_before_the_run() {
        let agent = Arc::new(ScriptedAgent::new(Vec::new(), Ending::Finish(Vec::new())));
        let resolver = |provider: Provider, supplied: Option<&str>| {
            assert_eq!(provider, Provider::Anthropic);
            assert_eq!(supplied, Some("client-key"));
            Some("resolved-key".to_string())
        };
        let bridge = StreamBridge::new(agent.clone(), Arc::new(resolver));

        let mut config = config();
        config.api_key = Some("client-key".to_string());
        let _ = bridge.start(Vec::new(), config).collect::<Vec<_>>().await;

        let seen = agent.seen_config.lock().unwrap().clone().unwrap();
        assert_eq!(seen.api_key.as_deref(), Some("resolved-key"));
    }

    #[tokio::test]
    async fn panicking_resolver_ends_the_stream_with_an_error() {
        let agent = Arc::new(ScriptedAgent::new(Vec::new(), Ending::Finish(Vec::new())));
        let resolver = |_: Provider, _: Option<&str>| -> Option<String> { panic!("keyring unavailable") };
        let stream = StreamBridge::new(agent.clone(), Arc::new(resolver)).start(Vec::new(), config());
        let mut state = stream.state_watch();

        let events = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("stream did not finish");

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { message, kind } => {
                assert_eq!(kind, "panic");
                assert!(message.contains("keyring unavailable"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(agent.seen_config.lock().unwrap().is_none());
        let settled = state.wait_for(|s| s.is_terminal()).await.map(|s| *s).unwrap();
        assert_eq!(settled, RunState::Failed);
    }

    #[tokio::test]
    async fn unresolved_credentials_are_passed_as_empty() {
        let agent = Arc::new(ScriptedAgent::new(Vec::new(), Ending::Finish(Vec::new())));
        let _ = bridge_for(agent.clone())
            .start(Vec::new(), config())
            .collect::<Vec<_>>()
            .await;

        let seen = agent.seen_config.lock().unwrap().clone().unwrap();
        assert_eq!(seen.api_key.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_and_settles_the_run() {
        let agent = Arc::new(ScriptedAgent::new(
            vec![
                Step::Output(ContentBlock::text("first")),
                Step::Sleep(Duration::from_secs(3600)),
                Step::Output(ContentBlock::text("never seen")),
            ],
            Ending::Finish(Vec::new()),
        ));
        let mut stream = bridge_for(agent.clone()).start(Vec::new(), config());
        let mut state = stream.state_watch();

        let first = stream.next().await;
        assert_eq!(
            first,
            Some(StreamEvent::Message {
                text: "first".to_string()
            })
        );
        drop(stream);

        let settled = tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_terminal()))
            .await
            .expect("run did not settle")
            .map(|s| *s)
            .unwrap();
        assert_eq!(settled, RunState::Cancelled);

        // The agent future was dropped at its suspension point and never resumed.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !agent.dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("agent future was not dropped");
        assert!(!agent.resumed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_cancel_waits_for_the_task() {
        let agent = Arc::new(ScriptedAgent::new(
            vec![
                Step::Output(ContentBlock::text("working")),
                Step::Sleep(Duration::from_secs(3600)),
            ],
            Ending::Finish(Vec::new()),
        ));
        let mut stream = bridge_for(agent.clone()).start(Vec::new(), config());
        assert!(stream.next().await.is_some());

        let state = tokio::time::timeout(Duration::from_secs(2), stream.cancel())
            .await
            .expect("cancel did not return");
        assert_eq!(state, RunState::Cancelled);
        assert!(agent.dropped.load(Ordering::SeqCst));
        assert!(!agent.resumed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_after_completion_keeps_final_state() {
        let agent = Arc::new(ScriptedAgent::new(Vec::new(), Ending::Finish(Vec::new())));
        let mut stream = bridge_for(agent).start(Vec::new(), config());
        while stream.next().await.is_some() {}

        assert_eq!(stream.cancel().await, RunState::Completed);
    }

    #[test]
    fn classify_maps_known_kinds() {
        assert_eq!(
            classify(&ContentBlock::text("hi")),
            Some(StreamEvent::Message {
                text: "hi".to_string()
            })
        );
        assert!(classify(&ContentBlock::Other(json!({"type": "document"}))).is_none());
    }
}
