//! Core type definitions for the Gemini client.
//!
//! This module contains the content model shared by every surface of the SDK
//! (unary, streaming, Live, tool calling) plus the wire request/response
//! structs for the REST endpoints. The type system is organized into three
//! main categories:
//!
//! # Content Model
//!
//! - [`Content`]: one conversation turn with a role and a list of parts
//! - [`Part`]: a single element of a turn — text, inline bytes, a file
//!   reference, a function call, or a function response
//! - [`Role`]: who produced the turn (`user` or `model`)
//!
//! # Flexible Input Normalization
//!
//! Callers can hand the SDK a plain string, a list of parts, full content
//! turns, or provider-native JSON. [`normalize_contents`] is the single
//! place that folds all of those shapes into the canonical `Vec<Content>`;
//! downstream code never sees the loose forms. Inline data with no MIME
//! type is sniffed from magic bytes ([`sniff_mime`]).
//!
//! # Wire Types
//!
//! Request/response payloads for the REST surfaces, serialized in the
//! provider's camelCase. Response structs also accept snake_case aliases so
//! both endpoint families parse into the same normalized structs.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ============================================================================
// CONTENT MODEL
// ============================================================================

/// Who produced a content turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the caller (including tool responses).
    User,
    /// Output from the model (including tool calls).
    Model,
}

/// A single conversation turn: a role plus ordered parts.
///
/// # Example
///
/// ```
/// use gemini_client::{Content, Part};
///
/// let turn = Content::user(vec![Part::text("What is 2+2?")]);
/// assert_eq!(turn.parts.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    /// Producer of the turn. Absent on system instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Ordered parts that make up the turn.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Creates a user turn from parts.
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some(Role::User),
            parts,
        }
    }

    /// Creates a model turn from parts.
    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Some(Role::Model),
            parts,
        }
    }

    /// Creates a user turn with a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    /// Creates a role-less turn (system instruction form).
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text of every text part in this turn.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All function calls carried by this turn.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { function_call } => Some(function_call),
                _ => None,
            })
            .collect()
    }
}

/// Raw bytes with a MIME type, carried inline in a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// MIME type of the data (e.g. `image/png`).
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Reference to previously uploaded file content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    /// MIME type of the referenced file, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// URI of the uploaded file.
    pub file_uri: String,
}

/// A request from the model to invoke a registered function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Correlation id; present when the server assigns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the function to invoke.
    pub name: String,
    /// JSON arguments for the invocation.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The result of a function invocation, echoed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    /// Correlation id matching the originating [`FunctionCall`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the function that produced this result.
    pub name: String,
    /// JSON result payload.
    pub response: serde_json::Value,
}

/// A single element of a content turn.
///
/// Serializes to the provider's one-key-per-variant object form:
///
/// ```json
/// {"text": "hello"}
/// {"inlineData": {"mimeType": "image/png", "data": "..."}}
/// {"functionCall": {"name": "get_time", "args": {}}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Part {
    /// A function call emitted by the model.
    #[serde(rename_all = "camelCase")]
    FunctionCall {
        /// The call payload.
        function_call: FunctionCall,
    },
    /// A function result supplied by the caller.
    #[serde(rename_all = "camelCase")]
    FunctionResponse {
        /// The result payload.
        function_response: FunctionResponse,
    },
    /// Inline binary data (images, audio) with its MIME type.
    #[serde(rename_all = "camelCase")]
    InlineData {
        /// The data payload.
        inline_data: Blob,
    },
    /// Reference to an uploaded file.
    #[serde(rename_all = "camelCase")]
    FileData {
        /// The file reference.
        file_data: FileData,
    },
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Creates an inline-data part from raw bytes, sniffing the MIME type
    /// from magic bytes when `mime_type` is `None`.
    pub fn inline_data(bytes: &[u8], mime_type: Option<&str>) -> Result<Self> {
        let mime = match mime_type {
            Some(m) => m.to_string(),
            None => sniff_mime(bytes)
                .ok_or_else(|| {
                    Error::validation("could not detect MIME type; pass one explicitly")
                })?
                .to_string(),
        };
        Ok(Part::InlineData {
            inline_data: Blob {
                mime_type: mime,
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        })
    }

    /// Creates a file-reference part.
    pub fn file_data(uri: impl Into<String>, mime_type: Option<String>) -> Self {
        Part::FileData {
            file_data: FileData {
                mime_type,
                file_uri: uri.into(),
            },
        }
    }

    /// Creates a function-call part.
    pub fn function_call(call: FunctionCall) -> Self {
        Part::FunctionCall {
            function_call: call,
        }
    }

    /// Creates a function-response part.
    pub fn function_response(response: FunctionResponse) -> Self {
        Part::FunctionResponse {
            function_response: response,
        }
    }
}

/// Detects an image MIME type from leading magic bytes.
///
/// Recognizes PNG, JPEG, GIF, and WebP. Returns `None` for anything else.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

// ============================================================================
// FLEXIBLE INPUT NORMALIZATION
// ============================================================================

/// The loose input shapes accepted at the public API boundary.
///
/// Everything converges on [`normalize_contents`], which produces the
/// canonical `Vec<Content>` the rest of the SDK operates on.
#[derive(Debug, Clone)]
pub enum ContentInput {
    /// A bare prompt string, treated as a single user text turn.
    Text(String),
    /// A list of parts, wrapped in a single user turn.
    Parts(Vec<Part>),
    /// Already-structured turns, used as-is.
    Contents(Vec<Content>),
    /// Provider-native JSON in any of the above shapes.
    Json(serde_json::Value),
}

impl From<&str> for ContentInput {
    fn from(s: &str) -> Self {
        ContentInput::Text(s.to_string())
    }
}

impl From<String> for ContentInput {
    fn from(s: String) -> Self {
        ContentInput::Text(s)
    }
}

impl From<Vec<Part>> for ContentInput {
    fn from(parts: Vec<Part>) -> Self {
        ContentInput::Parts(parts)
    }
}

impl From<Vec<Content>> for ContentInput {
    fn from(contents: Vec<Content>) -> Self {
        ContentInput::Contents(contents)
    }
}

impl From<Content> for ContentInput {
    fn from(content: Content) -> Self {
        ContentInput::Contents(vec![content])
    }
}

impl From<serde_json::Value> for ContentInput {
    fn from(value: serde_json::Value) -> Self {
        ContentInput::Json(value)
    }
}

/// Folds any accepted input shape into canonical content turns.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the input is empty or when JSON input
/// matches none of the accepted shapes.
pub fn normalize_contents(input: impl Into<ContentInput>) -> Result<Vec<Content>> {
    let contents = match input.into() {
        ContentInput::Text(text) => {
            if text.is_empty() {
                return Err(Error::validation("prompt text cannot be empty"));
            }
            vec![Content::user_text(text)]
        }
        ContentInput::Parts(parts) => {
            if parts.is_empty() {
                return Err(Error::validation("part list cannot be empty"));
            }
            vec![Content::user(parts)]
        }
        ContentInput::Contents(contents) => contents,
        ContentInput::Json(value) => normalize_json(value)?,
    };

    if contents.is_empty() {
        return Err(Error::validation("contents cannot be empty"));
    }
    for (i, content) in contents.iter().enumerate() {
        if content.parts.is_empty() {
            return Err(Error::validation(format!("content turn {i} has no parts")));
        }
    }
    Ok(contents)
}

fn normalize_json(value: serde_json::Value) -> Result<Vec<Content>> {
    match value {
        serde_json::Value::String(s) => normalize_contents(s),
        serde_json::Value::Array(items) => {
            // A list is either full turns or bare parts; decide from the
            // first element so mixed lists fail loudly.
            let looks_like_turns = items
                .first()
                .and_then(|v| v.as_object())
                .is_some_and(|o| o.contains_key("parts") || o.contains_key("role"));
            if looks_like_turns {
                let contents: Vec<Content> =
                    serde_json::from_value(serde_json::Value::Array(items))?;
                Ok(contents)
            } else {
                let parts = items
                    .into_iter()
                    .map(normalize_json_part)
                    .collect::<Result<Vec<_>>>()?;
                Ok(vec![Content::user(parts)])
            }
        }
        serde_json::Value::Object(_) => {
            // Either a single turn or a single part.
            if let Ok(content) = serde_json::from_value::<Content>(value.clone()) {
                if !content.parts.is_empty() {
                    return Ok(vec![content]);
                }
            }
            Ok(vec![Content::user(vec![normalize_json_part(value)?])])
        }
        other => Err(Error::validation(format!(
            "unsupported content input: {other}"
        ))),
    }
}

/// Accepts a part in wire form, or an inline-data block in the loose
/// `{mime_type?, data}` form callers often hold, sniffing the MIME type
/// from the decoded bytes when it is missing.
fn normalize_json_part(value: serde_json::Value) -> Result<Part> {
    if let Ok(part) = serde_json::from_value::<Part>(value.clone()) {
        return Ok(part);
    }
    let obj = value
        .as_object()
        .ok_or_else(|| Error::validation(format!("unsupported part input: {value}")))?;
    let data = obj
        .get("data")
        .and_then(|d| d.as_str())
        .ok_or_else(|| Error::validation("part object must carry a data field"))?;
    let mime = obj
        .get("mime_type")
        .or_else(|| obj.get("mimeType"))
        .and_then(|m| m.as_str());
    match mime {
        Some(m) => Ok(Part::InlineData {
            inline_data: Blob {
                mime_type: m.to_string(),
                data: data.to_string(),
            },
        }),
        None => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| Error::validation(format!("inline data is not base64: {e}")))?;
            Part::inline_data(&bytes, None)
        }
    }
}

/// Coarse pre-flight token estimate: ~4 characters per token.
///
/// This is an approximation used for budget reservations; actual usage is
/// reconciled from response metadata after the call.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Estimates input tokens for a set of content turns.
pub fn estimate_content_tokens(contents: &[Content]) -> u32 {
    contents.iter().map(|c| estimate_tokens(&c.text())).sum()
}

// ============================================================================
// GENERATION CONFIGURATION
// ============================================================================

/// Reasoning-budget configuration for thinking-capable models.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    /// Token budget for internal reasoning; `0` disables thinking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
    /// Whether thought summaries are returned in candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

/// Sampling and output configuration for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop_sequences: Vec<String>,
    /// MIME type of the response (e.g. `application/json` for JSON mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    /// JSON schema constraining the response when JSON mode is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_json_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerationConfig {
    /// Creates an empty config (all provider defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    /// Sets the maximum output tokens.
    pub fn with_max_output_tokens(mut self, n: i32) -> Self {
        self.max_output_tokens = Some(n);
        self
    }

    /// Switches the response to JSON mode with an optional schema.
    pub fn with_json_response(mut self, schema: Option<serde_json::Value>) -> Self {
        self.response_mime_type = Some("application/json".to_string());
        self.response_json_schema = schema;
        self
    }
}

/// A single safety category threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetySetting {
    /// Harm category name (e.g. `HARM_CATEGORY_HARASSMENT`).
    pub category: String,
    /// Block threshold (e.g. `BLOCK_MEDIUM_AND_ABOVE`).
    pub threshold: String,
}

/// A function the model may call, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    /// Unique function name.
    pub name: String,
    /// What the function does, for the model's benefit.
    pub description: String,
    /// JSON Schema for the arguments object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// A tool made available to the model: locally declared functions or a
/// provider builtin referenced by tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ToolSpec {
    /// Locally registered function declarations.
    FunctionDeclarations(Vec<FunctionDeclaration>),
    /// A provider-builtin tool referenced by its wire tag
    /// (e.g. `google_search`, `code_execution`). Serialized as
    /// `{"<tag>": {}}`.
    #[serde(untagged)]
    Builtin(serde_json::Value),
}

impl ToolSpec {
    /// Creates a builtin tool spec from its wire tag.
    pub fn builtin(tag: &str) -> Self {
        ToolSpec::Builtin(serde_json::json!({ tag: {} }))
    }
}

// ============================================================================
// REQUEST / RESPONSE WIRE TYPES
// ============================================================================

/// Request body for `generateContent` / `streamGenerateContent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub safety_settings: Vec<SafetySetting>,
    /// Name of a server-side cached-content resource to prepend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content: Option<String>,
}

/// Safety verdict attached to a candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRating {
    pub category: String,
    pub probability: String,
    #[serde(default)]
    pub blocked: bool,
}

/// One generated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default, alias = "finish_reason")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: Option<i32>,
    #[serde(default, alias = "safety_ratings")]
    pub safety_ratings: Vec<SafetyRating>,
}

/// Feedback about the prompt itself (block reasons, safety).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default, alias = "block_reason")]
    pub block_reason: Option<String>,
    #[serde(default, alias = "safety_ratings")]
    pub safety_ratings: Vec<SafetyRating>,
}

/// Token accounting attached to a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, alias = "prompt_token_count")]
    pub prompt_token_count: Option<u32>,
    #[serde(default, alias = "candidates_token_count")]
    pub candidates_token_count: Option<u32>,
    #[serde(default, alias = "total_token_count")]
    pub total_token_count: Option<u32>,
    #[serde(default, alias = "cached_content_token_count")]
    pub cached_content_token_count: Option<u32>,
}

impl UsageMetadata {
    /// Total billable tokens, falling back to prompt + candidates.
    pub fn billed_tokens(&self) -> u32 {
        self.total_token_count.unwrap_or_else(|| {
            self.prompt_token_count.unwrap_or(0) + self.candidates_token_count.unwrap_or(0)
        })
    }
}

/// Response body for `generateContent`, also the per-chunk shape for the
/// streaming variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, alias = "prompt_feedback")]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default, alias = "usage_metadata")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, alias = "model_version")]
    pub model_version: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate, if any.
    pub fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let content = candidate.content.as_ref()?;
        let text = content.text();
        if text.is_empty() { None } else { Some(text) }
    }

    /// Function calls requested by the first candidate.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.function_calls().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Finish reason of the first candidate.
    pub fn finish_reason(&self) -> Option<&str> {
        self.candidates.first()?.finish_reason.as_deref()
    }
}

/// Request body for `countTokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensRequest {
    pub contents: Vec<Content>,
}

/// Response body for `countTokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResponse {
    #[serde(alias = "total_tokens")]
    pub total_tokens: u32,
    #[serde(default, alias = "cached_content_token_count")]
    pub cached_content_token_count: Option<u32>,
}

/// Request body for `embedContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedContentRequest {
    /// Full model resource name (`models/...`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dimensionality: Option<i32>,
}

/// An embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentEmbedding {
    pub values: Vec<f32>,
}

/// Response body for `embedContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedContentResponse {
    pub embedding: ContentEmbedding,
}

/// Response body for `batchEmbedContents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmbedContentsResponse {
    #[serde(default)]
    pub embeddings: Vec<ContentEmbedding>,
}

/// Catalog entry for an available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Resource name (`models/gemini-2.0-flash`).
    pub name: String,
    #[serde(default, alias = "base_model_id")]
    pub base_model_id: Option<String>,
    #[serde(default, alias = "display_name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "input_token_limit")]
    pub input_token_limit: Option<u32>,
    #[serde(default, alias = "output_token_limit")]
    pub output_token_limit: Option<u32>,
    #[serde(default, alias = "supported_generation_methods")]
    pub supported_generation_methods: Vec<String>,
}

/// Response body for `models.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModelsResponse {
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default, alias = "next_page_token")]
    pub next_page_token: Option<String>,
}
