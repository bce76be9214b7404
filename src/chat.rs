//! Chat sessions and the tool-calling orchestrator.
//!
//! A [`ChatSession`] is a value object: ordered history turns plus the
//! session's system instruction, tools, and generation settings. The
//! orchestrator drives the multi-turn loop against any [`GenerateBackend`]:
//!
//! ```text
//! loop:
//!   response = backend.generate(history)
//!   calls = function calls in response
//!   if none: done
//!   history += model turn with the calls
//!   results = registry.execute_calls(calls)
//!   history += user turn with the responses
//! ```
//!
//! The history invariant holds throughout: every model function-call turn
//! is followed by a user turn answering exactly those call ids before any
//! later model turn. The loop is iterative, so turn count never grows the
//! stack.
//!
//! The streaming variant buffers the first stream while watching for
//! function calls; if any arrive it stops that stream, executes the tools,
//! and proxies a second stream with the extended history. Without calls,
//! the first stream's chunks pass through unchanged.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StreamErrorKind;
use crate::streaming::StreamEvent;
use crate::tools::ToolRegistry;
use crate::types::{
    Content, FunctionCall, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    Part, Role, SafetySetting,
};
use crate::{Error, Result};

/// Default bound on tool-calling rounds.
pub const DEFAULT_TURN_LIMIT: u32 = 10;

/// Anything that can execute generation requests for the orchestrator.
///
/// The production implementation is the client/coordinator; tests plug in
/// fakes.
#[async_trait]
pub trait GenerateBackend: Send + Sync {
    /// Unary generation.
    async fn generate(&self, request: GenerateContentRequest)
    -> Result<GenerateContentResponse>;

    /// Streaming generation; events arrive in upstream order.
    async fn stream_generate(
        &self,
        request: GenerateContentRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>>;
}

/// An in-memory conversation owned by the caller.
#[derive(Debug, Clone)]
pub struct ChatSession {
    history: Vec<Content>,
    system_instruction: Option<Content>,
    tools: ToolRegistry,
    generation_config: Option<GenerationConfig>,
    safety_settings: Vec<SafetySetting>,
    turn_limit: u32,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            system_instruction: None,
            tools: ToolRegistry::new(),
            generation_config: None,
            safety_settings: Vec::new(),
            turn_limit: DEFAULT_TURN_LIMIT,
        }
    }

    /// Sets the system instruction.
    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content::system(text));
        self
    }

    /// Sets the tool registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Sets generation config for every request in this session.
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = Some(config);
        self
    }

    /// Sets safety settings for every request in this session.
    pub fn with_safety_settings(mut self, settings: Vec<SafetySetting>) -> Self {
        self.safety_settings = settings;
        self
    }

    /// Bounds the tool-calling loop.
    pub fn with_turn_limit(mut self, limit: u32) -> Self {
        self.turn_limit = limit;
        self
    }

    /// Appends a user text turn.
    pub fn push_user_text(&mut self, text: impl Into<String>) {
        self.history.push(Content::user_text(text));
    }

    /// Appends a prepared turn.
    pub fn push_turn(&mut self, content: Content) {
        self.history.push(content);
    }

    /// The conversation so far.
    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// The session's tool registry.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Clears the conversation, keeping configuration.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Builds the wire request for the current history.
    pub fn to_request(&self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.history.clone(),
            system_instruction: self.system_instruction.clone(),
            tools: self.tools.to_tool_spec().into_iter().collect(),
            generation_config: self.generation_config.clone(),
            safety_settings: self.safety_settings.clone(),
            cached_content: None,
        }
    }

    /// Checks the tool-calling history invariant: every model turn carrying
    /// function calls is immediately followed by a user turn answering
    /// exactly those ids.
    pub fn validate_history(&self) -> Result<()> {
        for (i, turn) in self.history.iter().enumerate() {
            if turn.role != Some(Role::Model) {
                continue;
            }
            let call_ids: HashSet<&str> = turn
                .function_calls()
                .iter()
                .filter_map(|call| call.id.as_deref())
                .collect();
            if turn.function_calls().is_empty() {
                continue;
            }
            let Some(next) = self.history.get(i + 1) else {
                // Calls at the tail are awaiting their responses.
                continue;
            };
            if next.role != Some(Role::User) {
                return Err(Error::validation(format!(
                    "turn {} must answer the model's function calls",
                    i + 1
                )));
            }
            let response_ids: HashSet<&str> = next
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::FunctionResponse { function_response } => {
                        function_response.id.as_deref()
                    }
                    _ => None,
                })
                .collect();
            if !call_ids.is_subset(&response_ids) {
                return Err(Error::validation(format!(
                    "turn {} answers different call ids than turn {} issued",
                    i + 1,
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Runs the unary tool-calling loop until the model returns a terminal
/// (call-free) response or the turn limit is exhausted.
///
/// The final model turn is appended to the history on success.
pub async fn run_tool_loop<B>(
    backend: &B,
    chat: &mut ChatSession,
) -> Result<GenerateContentResponse>
where
    B: GenerateBackend + ?Sized,
{
    let limit = chat.turn_limit;
    for round in 0..=limit {
        if round == limit {
            return Err(Error::TurnLimitExceeded { limit });
        }
        let response = backend.generate(chat.to_request()).await?;
        let calls = response.function_calls();
        if calls.is_empty() {
            if let Some(content) = response
                .candidates
                .first()
                .and_then(|candidate| candidate.content.clone())
            {
                chat.history.push(Content {
                    role: Some(Role::Model),
                    parts: content.parts,
                });
            }
            return Ok(response);
        }

        debug!(round, calls = calls.len(), "executing tool round");
        push_call_round(chat, &calls).await;
    }
    unreachable!("loop either returns a response or exceeds the limit");
}

/// Appends the model's call turn, executes the calls, and appends the
/// answering user turn.
async fn push_call_round(chat: &mut ChatSession, calls: &[FunctionCall]) {
    chat.history.push(Content::model(
        calls.iter().cloned().map(Part::function_call).collect(),
    ));
    let results = chat.tools.execute_calls(calls).await;
    chat.history.push(Content::user(
        results.iter().map(|result| result.to_part()).collect(),
    ));
}

/// Output of the streaming orchestrator.
#[derive(Debug)]
pub struct OrchestratedStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl OrchestratedStream {
    /// Next proxied event; `None` once the stream finishes.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Collects remaining chunks, erroring on terminal failure.
    pub async fn collect_chunks(mut self) -> Result<Vec<GenerateContentResponse>> {
        let mut chunks = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Chunk(chunk) => chunks.push(chunk),
                StreamEvent::Complete => break,
                StreamEvent::Error { kind, message } => {
                    return Err(Error::stream(kind, 0, message));
                }
            }
        }
        Ok(chunks)
    }
}

/// Runs the streaming tool-calling variant.
///
/// Phase 1 buffers the first stream while watching for function calls.
/// When calls arrive, phase 2 executes them and extends the history; phase
/// 3 opens a second stream and proxies its chunks unchanged. Without calls
/// the buffered first stream passes through. Upstream errors terminate the
/// proxied stream with the same error.
pub fn run_streaming_tool_loop(
    backend: Arc<dyn GenerateBackend>,
    mut chat: ChatSession,
) -> OrchestratedStream {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Phase 1: buffer and inspect.
        let mut first = match backend.stream_generate(chat.to_request()).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = tx.send(StreamEvent::Error {
                    kind: StreamErrorKind::Connect,
                    message: err.to_string(),
                });
                return;
            }
        };

        let mut buffered: Vec<GenerateContentResponse> = Vec::new();
        let mut calls: Vec<FunctionCall> = Vec::new();
        loop {
            match first.recv().await {
                Some(StreamEvent::Chunk(chunk)) => {
                    let chunk_calls = chunk.function_calls();
                    buffered.push(chunk);
                    if !chunk_calls.is_empty() {
                        calls = chunk_calls;
                        // Stop consuming the first stream.
                        break;
                    }
                }
                Some(StreamEvent::Complete) | None => break,
                Some(event @ StreamEvent::Error { .. }) => {
                    let _ = tx.send(event);
                    return;
                }
            }
        }

        if calls.is_empty() {
            // No tool calls: the first stream is the final response.
            for chunk in buffered {
                let _ = tx.send(StreamEvent::Chunk(chunk));
            }
            let _ = tx.send(StreamEvent::Complete);
            return;
        }

        // Phase 2: execute tools and extend the history.
        drop(first);
        push_call_round(&mut chat, &calls).await;

        // Phase 3: proxy the second stream unchanged.
        let mut second = match backend.stream_generate(chat.to_request()).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = tx.send(StreamEvent::Error {
                    kind: StreamErrorKind::Connect,
                    message: err.to_string(),
                });
                return;
            }
        };
        while let Some(event) = second.recv().await {
            let terminal = !matches!(event, StreamEvent::Chunk(_));
            let _ = tx.send(event);
            if terminal {
                return;
            }
        }
        let _ = tx.send(StreamEvent::Complete);
    });
    OrchestratedStream { rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeBackend {
        unary: Mutex<VecDeque<GenerateContentResponse>>,
        streams: Mutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl FakeBackend {
        fn unary(responses: Vec<GenerateContentResponse>) -> Self {
            Self {
                unary: Mutex::new(responses.into()),
                streams: Mutex::new(VecDeque::new()),
            }
        }

        fn streaming(streams: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                unary: Mutex::new(VecDeque::new()),
                streams: Mutex::new(streams.into()),
            }
        }
    }

    #[async_trait]
    impl GenerateBackend for FakeBackend {
        async fn generate(
            &self,
            _request: GenerateContentRequest,
        ) -> Result<GenerateContentResponse> {
            self.unary
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::validation("fake backend exhausted"))
        }

        async fn stream_generate(
            &self,
            _request: GenerateContentRequest,
        ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
            let events = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::validation("fake backend exhausted"))?;
            let (tx, rx) = mpsc::unbounded_channel();
            for event in events {
                let _ = tx.send(event);
            }
            Ok(rx)
        }
    }

    fn text_response(text: &str) -> GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap()
    }

    fn call_response(id: &str, name: &str) -> GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"id": id, "name": name, "args": {}}}
                ]}
            }]
        }))
        .unwrap()
    }

    fn time_tools() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            tool("get_time", "Current time").build(|_| async move { Ok(json!({"now": "T"})) }),
        );
        registry
    }

    #[tokio::test]
    async fn test_tool_loop_terminal_without_calls() {
        let backend = FakeBackend::unary(vec![text_response("hi")]);
        let mut chat = ChatSession::new();
        chat.push_user_text("hello");
        let response = run_tool_loop(&backend, &mut chat).await.unwrap();
        assert_eq!(response.text().as_deref(), Some("hi"));
        // User turn plus appended model turn.
        assert_eq!(chat.history().len(), 2);
        assert_eq!(chat.history()[1].role, Some(Role::Model));
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_continues() {
        let backend = FakeBackend::unary(vec![
            call_response("c1", "get_time"),
            text_response("It is T"),
        ]);
        let mut chat = ChatSession::new().with_tools(time_tools());
        chat.push_user_text("What time is it?");

        let response = run_tool_loop(&backend, &mut chat).await.unwrap();
        assert_eq!(response.text().as_deref(), Some("It is T"));

        // user, model(call), user(response), model(text)
        let history = chat.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Some(Role::User));
        assert_eq!(history[1].role, Some(Role::Model));
        assert_eq!(history[1].function_calls().len(), 1);
        assert_eq!(history[2].role, Some(Role::User));
        assert!(matches!(
            history[2].parts[0],
            Part::FunctionResponse { .. }
        ));
        assert_eq!(history[3].role, Some(Role::Model));
        chat.validate_history().unwrap();
    }

    #[tokio::test]
    async fn test_tool_loop_turn_limit() {
        // The model never stops calling tools.
        let backend = FakeBackend::unary(
            (0..20)
                .map(|i| call_response(&format!("c{i}"), "get_time"))
                .collect(),
        );
        let mut chat = ChatSession::new()
            .with_tools(time_tools())
            .with_turn_limit(3);
        chat.push_user_text("loop forever");

        let err = run_tool_loop(&backend, &mut chat).await.unwrap_err();
        assert!(matches!(err, Error::TurnLimitExceeded { limit: 3 }));
    }

    #[tokio::test]
    async fn test_tool_loop_tool_error_feeds_back() {
        let backend = FakeBackend::unary(vec![
            call_response("c1", "unknown_tool"),
            text_response("recovered"),
        ]);
        let mut chat = ChatSession::new().with_tools(time_tools());
        chat.push_user_text("call something unknown");

        let response = run_tool_loop(&backend, &mut chat).await.unwrap();
        assert_eq!(response.text().as_deref(), Some("recovered"));
        // The error result was injected as a normal function response.
        let response_turn = &chat.history()[2];
        match &response_turn.parts[0] {
            Part::FunctionResponse { function_response } => {
                assert!(function_response.response["error"].is_string());
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_history_rejects_unanswered_calls() {
        let mut chat = ChatSession::new();
        chat.push_turn(Content::user_text("q"));
        chat.push_turn(Content::model(vec![Part::function_call(FunctionCall {
            id: Some("c1".to_string()),
            name: "f".to_string(),
            args: json!({}),
        })]));
        chat.push_turn(Content::model(vec![Part::text("answer")]));
        assert!(chat.validate_history().is_err());
    }

    #[test]
    fn test_validate_history_accepts_matched_ids() {
        let mut chat = ChatSession::new();
        chat.push_turn(Content::user_text("q"));
        chat.push_turn(Content::model(vec![Part::function_call(FunctionCall {
            id: Some("c1".to_string()),
            name: "f".to_string(),
            args: json!({}),
        })]));
        chat.push_turn(Content::user(vec![Part::function_response(
            crate::types::FunctionResponse {
                id: Some("c1".to_string()),
                name: "f".to_string(),
                response: json!({}),
            },
        )]));
        chat.validate_history().unwrap();
    }

    #[tokio::test]
    async fn test_streaming_passthrough_without_calls() {
        let backend = Arc::new(FakeBackend::streaming(vec![vec![
            StreamEvent::Chunk(text_response("Hel")),
            StreamEvent::Chunk(text_response("lo")),
            StreamEvent::Complete,
        ]]));
        let mut chat = ChatSession::new();
        chat.push_user_text("hi");

        let stream = run_streaming_tool_loop(backend, chat);
        let chunks = stream.collect_chunks().await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text().as_deref(), Some("Hel"));
        assert_eq!(chunks[1].text().as_deref(), Some("lo"));
    }

    #[tokio::test]
    async fn test_streaming_tool_phase_proxies_second_stream() {
        let backend = Arc::new(FakeBackend::streaming(vec![
            vec![
                StreamEvent::Chunk(call_response("c1", "get_time")),
                StreamEvent::Complete,
            ],
            vec![
                StreamEvent::Chunk(text_response("It is T")),
                StreamEvent::Complete,
            ],
        ]));
        let mut chat = ChatSession::new().with_tools(time_tools());
        chat.push_user_text("time?");

        let stream = run_streaming_tool_loop(backend, chat);
        let chunks = stream.collect_chunks().await.unwrap();
        // Only the second stream reaches the subscriber.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text().as_deref(), Some("It is T"));
    }

    #[tokio::test]
    async fn test_streaming_upstream_error_terminates() {
        let backend = Arc::new(FakeBackend::streaming(vec![vec![
            StreamEvent::Chunk(text_response("partial")),
            StreamEvent::Error {
                kind: StreamErrorKind::UpstreamClosed,
                message: "gone".to_string(),
            },
        ]]));
        let mut chat = ChatSession::new();
        chat.push_user_text("hi");

        let stream = run_streaming_tool_loop(backend, chat);
        let err = stream.collect_chunks().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Stream {
                kind: StreamErrorKind::UpstreamClosed,
                ..
            }
        ));
    }
}
