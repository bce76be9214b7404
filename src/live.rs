//! Live (bidirectional WebSocket) sessions.
//!
//! A [`LiveSession`] drives one persistent conversation over the Live
//! endpoint: it opens the socket, performs the setup handshake, then routes
//! every inbound server message to the registered [`LiveCallbacks`] in
//! strict receipt order while outbound sends are serialized through the
//! connection's single send queue.
//!
//! State machine:
//!
//! ```text
//! Idle -> Connecting -> SetupSent -> Ready -> Closing -> Closed
//! ```
//!
//! The first server frame after the setup must be `setupComplete`;
//! anything else fails the session with a setup error. `GoAway` keeps the
//! session in `Ready` but records a deadline hint. Transport errors and
//! close frames report through `on_error`/`on_close` and end in `Closed` —
//! there is no automatic reconnect; callers rebuild a session with the last
//! saved resumption handle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LiveErrorKind;
use crate::http::Headers;
use crate::types::{
    Blob, Content, FunctionCall, FunctionResponse, GenerationConfig, ToolSpec, UsageMetadata,
};
use crate::ws::{WsConn, WsFrame, WsReceiver, WsSender};
use crate::{Error, Result};

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

/// Session-resumption configuration carried in the setup frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionConfig {
    /// Handle from a previous session to rehydrate its context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// The first client frame of every Live connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Full model resource name (`models/...`).
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
    /// Present (even empty) to request input transcription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    /// Present (even empty) to request output transcription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

/// Caller content appended to the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// A realtime input chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RealtimeInput {
    /// An audio chunk.
    Audio(Blob),
    /// A video frame.
    Video(Blob),
    /// A text fragment.
    Text(String),
    /// Manual voice-activity start marker.
    ActivityStart {},
    /// Manual voice-activity end marker.
    ActivityEnd {},
    /// Flushes any buffered audio server-side.
    AudioStreamEnd(bool),
}

/// Tool results sent back for a pending [`ToolCallMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub function_responses: Vec<FunctionResponse>,
}

/// Outbound frames, serialized as single-key objects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponseMessage),
}

/// A transcription fragment attached to server content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finished: Option<bool>,
}

/// Model output and turn bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

/// A batch of function calls the server wants executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// Cancellation of previously issued function calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Notice that the server will close the connection soon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    /// Remaining time as a duration string (e.g. `"10s"`).
    #[serde(default)]
    pub time_left: Option<String>,
}

impl GoAway {
    /// Parses the remaining-time hint.
    pub fn time_left_duration(&self) -> Option<Duration> {
        let raw = self.time_left.as_deref()?;
        let (number, scale) = match raw.strip_suffix("ms") {
            Some(ms) => (ms, 1_000.0),
            None => (raw.strip_suffix('s')?, 1.0),
        };
        let value: f64 = number.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(value / scale))
    }
}

/// A new resumption handle for this conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,
    #[serde(default)]
    pub resumable: bool,
}

/// Voice-activity signal from server-side detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActivity {
    #[serde(default)]
    pub activity_start: bool,
    #[serde(default)]
    pub activity_end: bool,
}

/// Raw inbound frame shape: the server message union with one field set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub session_resumption_update: Option<SessionResumptionUpdate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub voice_activity: Option<VoiceActivity>,
}

/// One inbound server message, parsed once at the transport boundary into
/// a tagged variant.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SetupComplete,
    Content(ServerContent),
    ToolCall(ToolCallMessage),
    ToolCallCancellation(ToolCallCancellation),
    GoAway(GoAway),
    SessionResumptionUpdate(SessionResumptionUpdate),
    UsageMetadata(UsageMetadata),
    VoiceActivity(VoiceActivity),
}

impl ServerMessage {
    /// Collapses the union into its set variant.
    pub fn into_event(self) -> Option<ServerEvent> {
        if self.setup_complete.is_some() {
            Some(ServerEvent::SetupComplete)
        } else if let Some(content) = self.server_content {
            Some(ServerEvent::Content(content))
        } else if let Some(tool_call) = self.tool_call {
            Some(ServerEvent::ToolCall(tool_call))
        } else if let Some(cancellation) = self.tool_call_cancellation {
            Some(ServerEvent::ToolCallCancellation(cancellation))
        } else if let Some(go_away) = self.go_away {
            Some(ServerEvent::GoAway(go_away))
        } else if let Some(update) = self.session_resumption_update {
            Some(ServerEvent::SessionResumptionUpdate(update))
        } else if let Some(usage) = self.usage_metadata {
            Some(ServerEvent::UsageMetadata(usage))
        } else if let Some(activity) = self.voice_activity {
            Some(ServerEvent::VoiceActivity(activity))
        } else {
            None
        }
    }
}

// ============================================================================
// CALLBACKS
// ============================================================================

/// Which side a transcription fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionSource {
    Input,
    Output,
}

type MessageFn = dyn Fn(&ServerEvent) + Send + Sync;
type ToolCallFn = dyn Fn(&[FunctionCall]) -> Option<Vec<FunctionResponse>> + Send + Sync;
type ToolCancelFn = dyn Fn(&[String]) + Send + Sync;
type ErrorFn = dyn Fn(&Error) + Send + Sync;
type CloseFn = dyn Fn(u16, &str) + Send + Sync;
type TranscriptionFn = dyn Fn(TranscriptionSource, &str) + Send + Sync;
type VoiceActivityFn = dyn Fn(&VoiceActivity) + Send + Sync;
type ResumptionFn = dyn Fn(&SessionResumptionUpdate) + Send + Sync;
type GoAwayFn = dyn Fn(Option<Duration>) + Send + Sync;

/// Callbacks a session invokes from its reader, in receipt order.
///
/// All callbacks run synchronously on the reader; keep them cheap. Any
/// subset may be registered. When `on_tool_call` returns responses, the
/// session sends them back immediately as a tool-response frame.
#[derive(Default)]
pub struct LiveCallbacks {
    pub(crate) on_message: Option<Box<MessageFn>>,
    pub(crate) on_tool_call: Option<Box<ToolCallFn>>,
    pub(crate) on_tool_call_cancellation: Option<Box<ToolCancelFn>>,
    pub(crate) on_error: Option<Box<ErrorFn>>,
    pub(crate) on_close: Option<Box<CloseFn>>,
    pub(crate) on_transcription: Option<Box<TranscriptionFn>>,
    pub(crate) on_voice_activity: Option<Box<VoiceActivityFn>>,
    pub(crate) on_session_resumption: Option<Box<ResumptionFn>>,
    pub(crate) on_go_away: Option<Box<GoAwayFn>>,
}

impl LiveCallbacks {
    /// Creates an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every routed server event.
    pub fn on_message(mut self, f: impl Fn(&ServerEvent) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Called with each tool-call batch; returned responses are sent back
    /// immediately.
    pub fn on_tool_call(
        mut self,
        f: impl Fn(&[FunctionCall]) -> Option<Vec<FunctionResponse>> + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_call = Some(Box::new(f));
        self
    }

    /// Called when the server cancels previously issued tool calls.
    pub fn on_tool_call_cancellation(
        mut self,
        f: impl Fn(&[String]) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_call_cancellation = Some(Box::new(f));
        self
    }

    /// Called on terminal session errors.
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called when the transport closes.
    pub fn on_close(mut self, f: impl Fn(u16, &str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Called with input/output transcription fragments.
    pub fn on_transcription(
        mut self,
        f: impl Fn(TranscriptionSource, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_transcription = Some(Box::new(f));
        self
    }

    /// Called on voice-activity signals.
    pub fn on_voice_activity(
        mut self,
        f: impl Fn(&VoiceActivity) + Send + Sync + 'static,
    ) -> Self {
        self.on_voice_activity = Some(Box::new(f));
        self
    }

    /// Called whenever the server issues a new resumption handle.
    pub fn on_session_resumption(
        mut self,
        f: impl Fn(&SessionResumptionUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_resumption = Some(Box::new(f));
        self
    }

    /// Called when the server announces an upcoming close.
    pub fn on_go_away(mut self, f: impl Fn(Option<Duration>) + Send + Sync + 'static) -> Self {
        self.on_go_away = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for LiveCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCallbacks")
            .field("on_message", &self.on_message.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Lifecycle state of a Live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    SetupSent,
    Ready,
    Closing,
    Closed,
}

/// Session configuration beyond the setup payload.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// The setup frame to send first.
    pub setup: Setup,
    /// How long to wait for `setupComplete`.
    pub setup_timeout: Duration,
}

impl LiveConfig {
    /// Creates a config for a model with defaults.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            setup: Setup {
                model: model.into(),
                ..Setup::default()
            },
            setup_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the generation config carried in the setup frame.
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.setup.generation_config = Some(config);
        self
    }

    /// Sets the system instruction.
    pub fn with_system_instruction(mut self, instruction: Content) -> Self {
        self.setup.system_instruction = Some(instruction);
        self
    }

    /// Declares tools for the session.
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.setup.tools = tools;
        self
    }

    /// Resumes a previous conversation via its handle.
    pub fn with_resume_handle(mut self, handle: impl Into<String>) -> Self {
        self.setup.session_resumption = Some(SessionResumptionConfig {
            handle: Some(handle.into()),
        });
        self
    }

    /// Requests session-resumption updates without a prior handle.
    pub fn with_session_resumption(mut self) -> Self {
        self.setup
            .session_resumption
            .get_or_insert_with(SessionResumptionConfig::default);
        self
    }

    /// Requests input and output transcription.
    pub fn with_transcription(mut self) -> Self {
        self.setup.input_audio_transcription = Some(serde_json::json!({}));
        self.setup.output_audio_transcription = Some(serde_json::json!({}));
        self
    }
}

/// Shared mutable session bookkeeping, owned by the reader, observed by the
/// handle.
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SessionStateCell>,
    resumption_handle: Mutex<Option<String>>,
    pending_tool_calls: Mutex<HashSet<String>>,
    deadline_hint: Mutex<Option<Instant>>,
}

#[derive(Debug)]
struct SessionStateCell(SessionState);

impl Default for SessionStateCell {
    fn default() -> Self {
        Self(SessionState::Idle)
    }
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.lock().expect("state lock").0 = state;
    }

    fn state(&self) -> SessionState {
        self.state.lock().expect("state lock").0
    }
}

/// A connected Live session.
///
/// Outbound sends are serialized in call order; inbound messages route to
/// callbacks in receipt order on a dedicated reader task.
pub struct LiveSession {
    sender: WsSender,
    shared: Arc<Shared>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl LiveSession {
    /// Opens a session: connects, sends the setup frame, and waits for the
    /// server's `setupComplete` before returning.
    ///
    /// # Errors
    ///
    /// [`Error::Live`] with [`LiveErrorKind::SetupFailed`] when the server
    /// rejects the setup or answers with anything else first.
    pub async fn connect(
        url: &str,
        headers: &Headers,
        config: LiveConfig,
        callbacks: LiveCallbacks,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        shared.set_state(SessionState::Connecting);

        let conn = match WsConn::connect(url, headers).await {
            Ok(conn) => conn,
            Err(err) => {
                shared.set_state(SessionState::Closed);
                return Err(err);
            }
        };
        let (sender, mut receiver) = conn.split();

        let setup_frame = serde_json::to_string(&ClientMessage::Setup(config.setup.clone()))?;
        sender.send_text(setup_frame).await?;
        shared.set_state(SessionState::SetupSent);

        // The first inbound frame decides the session's fate.
        let first = tokio::time::timeout(config.setup_timeout, receiver.next()).await;
        match first {
            Err(_) => {
                shared.set_state(SessionState::Closed);
                let _ = sender.close().await;
                return Err(Error::live(LiveErrorKind::SetupFailed));
            }
            Ok(None) => {
                shared.set_state(SessionState::Closed);
                return Err(Error::live(LiveErrorKind::SetupFailed));
            }
            Ok(Some(Err(err))) => {
                shared.set_state(SessionState::Closed);
                return Err(err);
            }
            Ok(Some(Ok(frame))) => {
                let event = match decode_frame(&frame) {
                    Ok(event) => event,
                    Err(err) => {
                        shared.set_state(SessionState::Closed);
                        let _ = sender.close().await;
                        return Err(err);
                    }
                };
                match event {
                    Some(ServerEvent::SetupComplete) => {
                        shared.set_state(SessionState::Ready);
                        if let Some(on_message) = &callbacks.on_message {
                            on_message(&ServerEvent::SetupComplete);
                        }
                    }
                    _ => {
                        shared.set_state(SessionState::Closed);
                        let _ = sender.close().await;
                        return Err(setup_failure_for_frame(&frame));
                    }
                }
            }
        }

        let reader = spawn_reader(receiver, sender.clone(), shared.clone(), callbacks);
        Ok(Self {
            sender,
            shared,
            reader: Some(reader),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Latest server-issued resumption handle, if any.
    pub fn resumption_handle(&self) -> Option<String> {
        self.shared
            .resumption_handle
            .lock()
            .expect("handle lock")
            .clone()
    }

    /// Tool-call ids issued but not yet responded to or cancelled.
    pub fn pending_tool_calls(&self) -> Vec<String> {
        self.shared
            .pending_tool_calls
            .lock()
            .expect("pending lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Deadline hint from the last `GoAway`, if one arrived.
    pub fn deadline_hint(&self) -> Option<Instant> {
        *self.shared.deadline_hint.lock().expect("deadline lock")
    }

    /// Appends caller turns; `turn_complete` lets the model respond and
    /// interrupts any in-flight generation server-side.
    pub async fn send_client_content(
        &self,
        turns: Vec<Content>,
        turn_complete: bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.send(&ClientMessage::ClientContent(ClientContent {
            turns,
            turn_complete,
        }))
        .await
    }

    /// Streams a realtime input chunk (audio, video, text, or an activity
    /// marker).
    pub async fn send_realtime_input(&self, input: RealtimeInput) -> Result<()> {
        self.ensure_ready()?;
        self.send(&ClientMessage::RealtimeInput(input)).await
    }

    /// Sends responses for a previously received tool call.
    pub async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.ensure_ready()?;
        {
            let mut pending = self
                .shared
                .pending_tool_calls
                .lock()
                .expect("pending lock");
            for response in &responses {
                if let Some(id) = &response.id {
                    pending.remove(id);
                }
            }
        }
        self.send(&ClientMessage::ToolResponse(ToolResponseMessage {
            function_responses: responses,
        }))
        .await
    }

    /// Closes the session: drains the send queue, sends a close frame, and
    /// waits for the reader to finish.
    pub async fn close(mut self) -> Result<()> {
        self.shared.set_state(SessionState::Closing);
        let _ = self.sender.close().await;
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        self.shared.set_state(SessionState::Closed);
        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        self.sender.send_text(frame).await
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(Error::live(LiveErrorKind::Closed {
                code: 1000,
                reason: format!("session is {state:?}, not Ready"),
            })),
        }
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn decode_frame(frame: &WsFrame) -> Result<Option<ServerEvent>> {
    let text = match frame {
        WsFrame::Text(text) => text.as_str(),
        WsFrame::Binary(bytes) => std::str::from_utf8(bytes)
            .map_err(|_| Error::live(LiveErrorKind::ProtocolViolation))?,
        WsFrame::Closed { .. } => return Ok(None),
    };
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|_| Error::live(LiveErrorKind::ProtocolViolation))?;
    Ok(message.into_event())
}

/// Maps a bad first frame to the right setup failure. Close codes 1007/1008
/// whose diagnostic names an unknown field mean the endpoint does not
/// support the requested setup shape.
fn setup_failure_for_frame(frame: &WsFrame) -> Error {
    if let WsFrame::Closed { code, reason } = frame {
        if matches!(code, 1007 | 1008)
            && (reason.contains("Unknown name") || reason.contains("is not found"))
        {
            return Error::live(LiveErrorKind::Closed {
                code: *code,
                reason: format!("setup unsupported: {reason}"),
            });
        }
        return Error::live(LiveErrorKind::Closed {
            code: *code,
            reason: reason.clone(),
        });
    }
    Error::live(LiveErrorKind::SetupFailed)
}

fn spawn_reader(
    mut receiver: WsReceiver,
    sender: WsSender,
    shared: Arc<Shared>,
    callbacks: LiveCallbacks,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let router = Router { shared: shared.clone(), callbacks };
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(WsFrame::Closed { code, reason }) => {
                    router.handle_close(code, &reason);
                    return;
                }
                Ok(frame) => match decode_frame(&frame) {
                    Ok(Some(event)) => {
                        if let Some(responses) = router.route(event) {
                            let message =
                                ClientMessage::ToolResponse(ToolResponseMessage {
                                    function_responses: responses,
                                });
                            match serde_json::to_string(&message) {
                                Ok(text) => {
                                    if let Err(err) = sender.send_text(text).await {
                                        router.handle_error(&err);
                                        return;
                                    }
                                }
                                Err(err) => warn!(error = %err, "tool response unserializable"),
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(error = %err, "undecodable live frame");
                        router.handle_error(&err);
                    }
                },
                Err(err) => {
                    router.handle_error(&err);
                    shared.set_state(SessionState::Closed);
                    return;
                }
            }
        }
        // Transport gone without a close frame. A voluntary close is not
        // reported back to the caller who initiated it.
        match shared.state() {
            SessionState::Closed => {}
            SessionState::Closing => shared.set_state(SessionState::Closed),
            _ => router.handle_close(1006, "connection lost"),
        }
    })
}

/// Routes parsed server events to callbacks and updates session state.
///
/// Factored out of the reader so the routing rules are testable without a
/// socket.
struct Router {
    shared: Arc<Shared>,
    callbacks: LiveCallbacks,
}

impl Router {
    /// Routes one event. Returns tool responses to send back, if the
    /// tool-call callback produced any.
    fn route(&self, event: ServerEvent) -> Option<Vec<FunctionResponse>> {
        if let Some(on_message) = &self.callbacks.on_message {
            on_message(&event);
        }
        match event {
            ServerEvent::SetupComplete => None,
            ServerEvent::Content(content) => {
                if let Some(on_transcription) = &self.callbacks.on_transcription {
                    if let Some(text) = content
                        .input_transcription
                        .as_ref()
                        .and_then(|t| t.text.as_deref())
                    {
                        on_transcription(TranscriptionSource::Input, text);
                    }
                    if let Some(text) = content
                        .output_transcription
                        .as_ref()
                        .and_then(|t| t.text.as_deref())
                    {
                        on_transcription(TranscriptionSource::Output, text);
                    }
                }
                None
            }
            ServerEvent::ToolCall(tool_call) => {
                {
                    let mut pending = self
                        .shared
                        .pending_tool_calls
                        .lock()
                        .expect("pending lock");
                    for call in &tool_call.function_calls {
                        if let Some(id) = &call.id {
                            pending.insert(id.clone());
                        }
                    }
                }
                let responses = self
                    .callbacks
                    .on_tool_call
                    .as_ref()
                    .and_then(|f| f(&tool_call.function_calls));
                if let Some(responses) = &responses {
                    let mut pending = self
                        .shared
                        .pending_tool_calls
                        .lock()
                        .expect("pending lock");
                    for response in responses {
                        if let Some(id) = &response.id {
                            pending.remove(id);
                        }
                    }
                }
                responses
            }
            ServerEvent::ToolCallCancellation(cancellation) => {
                {
                    let mut pending = self
                        .shared
                        .pending_tool_calls
                        .lock()
                        .expect("pending lock");
                    for id in &cancellation.ids {
                        pending.remove(id);
                    }
                }
                if let Some(on_cancel) = &self.callbacks.on_tool_call_cancellation {
                    on_cancel(&cancellation.ids);
                }
                None
            }
            ServerEvent::GoAway(go_away) => {
                let time_left = go_away.time_left_duration();
                if let Some(time_left) = time_left {
                    *self.shared.deadline_hint.lock().expect("deadline lock") =
                        Some(Instant::now() + time_left);
                }
                if let Some(on_go_away) = &self.callbacks.on_go_away {
                    on_go_away(time_left);
                }
                None
            }
            ServerEvent::SessionResumptionUpdate(update) => {
                if update.resumable {
                    if let Some(handle) = &update.new_handle {
                        *self
                            .shared
                            .resumption_handle
                            .lock()
                            .expect("handle lock") = Some(handle.clone());
                    }
                }
                if let Some(on_resumption) = &self.callbacks.on_session_resumption {
                    on_resumption(&update);
                }
                None
            }
            ServerEvent::UsageMetadata(_) => None,
            ServerEvent::VoiceActivity(activity) => {
                if let Some(on_activity) = &self.callbacks.on_voice_activity {
                    on_activity(&activity);
                }
                None
            }
        }
    }

    fn handle_close(&self, code: u16, reason: &str) {
        self.shared.set_state(SessionState::Closed);
        if let Some(on_close) = &self.callbacks.on_close {
            on_close(code, reason);
        }
    }

    fn handle_error(&self, err: &Error) {
        if let Some(on_error) = &self.callbacks.on_error {
            on_error(err);
        }
    }
}
