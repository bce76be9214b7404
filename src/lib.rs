//! # Gemini Client for Rust
//!
//! A streaming-first Rust client for the Gemini generative-AI platform,
//! covering both of its transport surfaces: request/response HTTPS with
//! server-sent-event streaming, and persistent WebSocket ("Live") sessions.
//!
//! ## Key Features
//!
//! - **Two auth backends, one API**: API-key auth against the REST
//!   endpoint, or OAuth2 service-account auth against the regional Vertex
//!   endpoint, multiplexed behind a single client
//! - **Local rate limiting**: per-model permit pools, a sliding token
//!   budget with pre-flight reservation, and shared 429 retry windows
//! - **Streaming**: managed SSE streams with subscriber fan-out,
//!   reconnects, and backpressure-aware delivery
//! - **Live sessions**: bidirectional audio/video/text over WebSocket with
//!   tool calling, transcription, resumption handles, and `GoAway` handling
//! - **Tool calling**: a function registry plus an orchestrator that loops
//!   model calls through local handlers until a terminal response
//! - **Long-running operations**: generic polling with backoff, progress
//!   callbacks, and cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gemini_client::{Client, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads GEMINI_API_KEY (or the Vertex variables) from the environment.
//!     let client = Client::from_env()?;
//!
//!     let response = client
//!         .generate("What is 2+2?", &RequestOptions::default())
//!         .await?;
//!     println!("{}", response.text().unwrap_or_default());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use gemini_client::{Client, RequestOptions, StreamEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::from_env()?;
//! let mut stream = client
//!     .stream_generate("Tell me a story", &RequestOptions::default())
//!     .await?;
//!
//! while let Some(event) = stream.next().await {
//!     match event {
//!         StreamEvent::Chunk(chunk) => {
//!             if let Some(text) = chunk.text() {
//!                 print!("{text}");
//!             }
//!         }
//!         StreamEvent::Complete => break,
//!         StreamEvent::Error { message, .. } => {
//!             eprintln!("stream failed: {message}");
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **client**: the coordinator — auth resolution, limiter application,
//!   driver selection, response parsing
//! - **auth**: API-key and OAuth service-account credential handling with
//!   token caching and single-flight refresh
//! - **limiter**: the process-wide rate limiter actor
//! - **streaming**: SSE stream lifecycle and subscriber fan-out
//! - **live**: the WebSocket session state machine
//! - **chat** / **tools**: chat sessions, the function registry, and the
//!   tool-calling orchestrator
//! - **http** / **ws**: the plain transports; no retry policy of their own
//! - **operation**: long-running-operation polling
//! - **types**: the content model and wire structs
//! - **config** / **error** / **retry**: ambient concerns

mod auth;
mod chat;
mod client;
mod config;
mod error;
mod http;
mod limiter;
mod live;
mod operation;
mod streaming;
mod tools;
mod types;
mod ws;

/// Retry utilities with exponential backoff and `RetryInfo` parsing.
/// Public so callers can reuse the policy machinery for their own calls.
pub mod retry;

// --- Coordinator ---

pub use client::{Client, ClientBuilder, RequestOptions};

// --- Auth ---

pub use auth::{AuthMux, CachedToken, CredentialSource, Credentials, ResolvedAuth};

// --- Configuration ---

pub use config::{AuthStrategy, ClientConfig, ModelRegistry, UseCase, detect_strategy};

// --- Errors ---

pub use error::{BudgetBlockedReason, Error, LiveErrorKind, Result, StreamErrorKind};

// --- Rate limiting ---

pub use limiter::{KeySettings, KeySnapshot, LimiterSettings, RateLimiter, Reservation, ReserveRequest};

// --- Streaming ---

pub use streaming::{
    StreamEvent, StreamId, StreamManager, StreamManagerConfig, StreamRequest, StreamStatus,
    Subscription,
};

// --- Live sessions ---

pub use live::{
    ClientContent, GoAway, LiveCallbacks, LiveConfig, LiveSession, RealtimeInput, ServerContent,
    ServerEvent, SessionResumptionConfig, SessionResumptionUpdate, SessionState, Setup,
    ToolCallCancellation, ToolCallMessage, Transcription, TranscriptionSource, VoiceActivity,
};

// --- Chat & tools ---

pub use chat::{
    ChatSession, DEFAULT_TURN_LIMIT, GenerateBackend, OrchestratedStream, run_streaming_tool_loop,
    run_tool_loop,
};
pub use tools::{Tool, ToolBuilder, ToolExecutionResult, ToolHandler, ToolRegistry, tool};

// --- Long-running operations ---

pub use operation::{Operation, OperationError, PollConfig, PollToken, poll_operation};

// --- Transports ---

pub use http::{Headers, HttpResponse, HttpTransport};
pub use ws::{WsConn, WsFrame, WsReceiver, WsSender};

// --- Content model & wire types ---

pub use types::{
    BatchEmbedContentsResponse, Blob, Candidate, Content, ContentEmbedding, ContentInput,
    CountTokensRequest, CountTokensResponse, EmbedContentRequest, EmbedContentResponse, FileData,
    FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, ListModelsResponse, Model, Part, PromptFeedback,
    Role, SafetyRating, SafetySetting, ThinkingConfig, ToolSpec, UsageMetadata,
    estimate_content_tokens, estimate_tokens, normalize_contents, sniff_mime,
};

/// Convenience module containing the most commonly used types and functions.
/// Import with `use gemini_client::prelude::*;` to get everything you need
/// for typical usage.
pub mod prelude {
    pub use crate::{
        AuthStrategy, ChatSession, Client, Content, ContentInput, Error, GenerateContentResponse,
        GenerationConfig, LiveCallbacks, LiveConfig, Part, RequestOptions, Result, Role,
        StreamEvent, Tool, ToolRegistry, tool,
    };
}
