//! The coordinator: one entry point for every request.
//!
//! [`Client`] validates and normalizes caller input, resolves auth headers
//! and the endpoint for the active strategy, applies the rate limiter,
//! dispatches to the right execution driver (unary, SSE stream, Live
//! session, or LRO polling), and parses responses into the normalized
//! structs regardless of which endpoint family served them.
//!
//! Unary calls retry transient failures (429 with honored `RetryInfo`,
//! 5xx, transport errors) with exponential backoff; streaming hands off to
//! the stream manager, whose worker owns the permit for the stream's
//! lifetime. Tool-calling chat wraps the orchestrator in
//! [`Client::chat_send`]/[`Client::chat_stream`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::auth::{AuthMux, Credentials, ResolvedAuth};
use crate::chat::{ChatSession, GenerateBackend, OrchestratedStream};
use crate::config::{AuthStrategy, ClientConfig, ModelRegistry, UseCase, detect_strategy};
use crate::http::{Headers, HttpTransport};
use crate::limiter::{KeySettings, RateLimiter, Reservation, ReserveRequest};
use crate::live::{LiveCallbacks, LiveConfig, LiveSession};
use crate::operation::{Operation, PollConfig, PollToken, poll_operation};
use crate::retry::{RetryConfig, classify_http_error, retry_with_backoff_conditional};
use crate::streaming::{
    StreamEvent, StreamManager, StreamManagerConfig, StreamRequest, Subscription,
};
use crate::types::{
    BatchEmbedContentsResponse, Content, ContentInput, CountTokensRequest, CountTokensResponse,
    EmbedContentRequest, EmbedContentResponse, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, ListModelsResponse, Model, SafetySetting, ToolSpec, estimate_content_tokens,
    normalize_contents,
};
use crate::{Error, Result};

/// REST API version per endpoint family.
const GEMINI_API_VERSION: &str = "v1beta";
const VERTEX_API_VERSION: &str = "v1";

/// Live WebSocket paths per endpoint family.
const GEMINI_WS_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const VERTEX_WS_PATH: &str = "/ws/google.cloud.aiplatform.v1beta1.LlmBidiService.BidiGenerateContent";

/// Per-request options.
///
/// Everything is optional; unset fields fall back to the client's
/// [`ClientConfig`] and registry defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Auth strategy override.
    pub auth: Option<AuthStrategy>,
    /// Model id override.
    pub model: Option<String>,
    /// Per-attempt timeout override.
    pub timeout: Option<Duration>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
    /// Backoff ceiling override.
    pub max_backoff: Option<Duration>,
    /// Skip the local rate limiter entirely.
    pub disable_rate_limiter: bool,
    /// Never sleep on the limiter; surface shortfalls immediately.
    pub non_blocking: bool,
    /// Permit pool size for this request's key (first touch only).
    pub max_concurrency: Option<u32>,
    /// Limiter partition override; defaults to the model id.
    pub concurrency_key: Option<String>,
    /// Blocking wait bound for a permit; `None` uses the client config.
    pub permit_timeout: Option<Duration>,
    /// Token budget per window for this request's key (first touch only).
    pub token_budget_per_window: Option<u32>,
    /// Caller-known input token count; skips the character heuristic.
    pub estimated_input_tokens: Option<u32>,
    /// Tokens expected to be served from server-side cache.
    pub estimated_cached_tokens: Option<u32>,
    /// Single-request budget ceiling multiplier override.
    pub budget_safety_multiplier: Option<f64>,
    /// Blocking wait bound on a full budget window.
    pub max_budget_wait: Option<Duration>,
    /// Server-side cached-content resource to prepend.
    pub cached_content: Option<String>,
    /// Tools for this request.
    pub tools: Vec<ToolSpec>,
    /// System instruction for this request.
    pub system_instruction: Option<Content>,
    /// Generation config for this request.
    pub generation_config: Option<GenerationConfig>,
    /// Safety settings for this request.
    pub safety_settings: Vec<SafetySetting>,
    /// Response MIME type shortcut (merged into the generation config).
    pub response_mime_type: Option<String>,
    /// Response JSON schema shortcut (merged into the generation config).
    pub response_json_schema: Option<serde_json::Value>,
}

impl RequestOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the model id.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the auth strategy.
    pub fn with_auth(mut self, strategy: AuthStrategy) -> Self {
        self.auth = Some(strategy);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the system instruction from text.
    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content::system(text));
        self
    }

    /// Sets the generation config.
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = Some(config);
        self
    }

    /// Adds a tool spec.
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    /// Sets the caller-known input token estimate.
    pub fn with_estimated_input_tokens(mut self, tokens: u32) -> Self {
        self.estimated_input_tokens = Some(tokens);
        self
    }

    /// Sets the limiter partition key.
    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    /// Makes limiter interactions non-blocking.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// Disables the local rate limiter for this request.
    pub fn without_rate_limiter(mut self) -> Self {
        self.disable_rate_limiter = true;
        self
    }

    /// Merges the response-shape shortcuts into a generation config.
    fn effective_generation_config(&self) -> Option<GenerationConfig> {
        let mut config = self.generation_config.clone();
        if self.response_mime_type.is_some() || self.response_json_schema.is_some() {
            let config = config.get_or_insert_with(GenerationConfig::default);
            if let Some(mime) = &self.response_mime_type {
                config.response_mime_type = Some(mime.clone());
            }
            if let Some(schema) = &self.response_json_schema {
                config.response_json_schema = Some(schema.clone());
            }
        }
        config
    }
}

/// Builder for [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    credentials: HashMap<AuthStrategy, Credentials>,
    default_strategy: Option<AuthStrategy>,
    config: ClientConfig,
    registry: ModelRegistry,
    limiter: Option<RateLimiter>,
    endpoint_override: Option<String>,
}

impl ClientBuilder {
    /// Adds credentials for a strategy.
    pub fn credentials(mut self, strategy: AuthStrategy, credentials: Credentials) -> Self {
        self.credentials.insert(strategy, credentials);
        self
    }

    /// Shorthand for API-key credentials.
    pub fn api_key(self, key: impl Into<String>) -> Self {
        self.credentials(AuthStrategy::Gemini, Credentials::api_key(key))
    }

    /// Sets the default strategy when a request names none.
    pub fn default_strategy(mut self, strategy: AuthStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Replaces the process-wide defaults.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the model registry.
    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Uses a dedicated limiter instead of the process-wide one. Mostly for
    /// tests and multi-tenant embedders.
    pub fn limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Routes every request to this base URL instead of the strategy's
    /// endpoint. For proxies and test servers.
    pub fn endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint_override = Some(base_url.into());
        self
    }

    /// Validates and builds the client.
    ///
    /// With no explicit credentials, the environment is consulted the same
    /// way [`detect_strategy`] does.
    pub fn build(mut self) -> Result<Client> {
        if self.credentials.is_empty() {
            let strategy = detect_strategy().ok_or_else(|| {
                Error::auth(
                    "env",
                    "no credentials configured and none found in the environment",
                )
            })?;
            self.credentials
                .insert(strategy, Credentials::from_env(strategy)?);
        }
        let default_strategy = self
            .default_strategy
            .or_else(|| {
                // Prefer the API-key surface when both are configured.
                if self.credentials.contains_key(&AuthStrategy::Gemini) {
                    Some(AuthStrategy::Gemini)
                } else {
                    self.credentials.keys().next().copied()
                }
            })
            .ok_or_else(|| Error::validation("no auth strategy available"))?;

        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None if self.config.adaptive_concurrency => {
                RateLimiter::new(crate::limiter::LimiterSettings {
                    key_defaults: KeySettings {
                        max_permits: self.config.max_concurrency_per_model,
                        window_duration: self.config.window_duration,
                        budget_total: self.config.token_budget_per_window,
                        safety_multiplier: self.config.budget_safety_multiplier,
                    },
                    adaptive: true,
                    adaptive_ceiling: self.config.adaptive_ceiling,
                })
            }
            None => RateLimiter::global().clone(),
        };

        let transport = HttpTransport::new(self.config.connect_timeout)?;
        let streams = StreamManager::new(
            StreamManagerConfig {
                cleanup_delay: self.config.stream_cleanup_delay,
                receive_timeout: self.config.stream_receive_timeout,
            },
            transport.clone(),
            limiter.clone(),
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                auth: AuthMux::new(self.credentials),
                transport,
                limiter,
                streams,
                registry: self.registry,
                default_strategy,
                endpoint_override: self.endpoint_override,
            }),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    auth: AuthMux,
    transport: HttpTransport,
    limiter: RateLimiter,
    streams: StreamManager,
    registry: ModelRegistry,
    default_strategy: AuthStrategy,
    endpoint_override: Option<String>,
}

/// The coordinator. Cheap to clone; clones share auth caches, the limiter,
/// and the stream manager.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts a builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Builds a client purely from the environment.
    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }

    /// The default auth strategy for this client.
    pub fn default_strategy(&self) -> AuthStrategy {
        self.inner.default_strategy
    }

    /// The model registry in use.
    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// The limiter handle, for diagnostics.
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    // ------------------------------------------------------------------
    // Unary entry points
    // ------------------------------------------------------------------

    /// Generates content from any accepted input shape.
    #[instrument(skip_all, fields(model = ?opts.model))]
    pub async fn generate(
        &self,
        input: impl Into<ContentInput>,
        opts: &RequestOptions,
    ) -> Result<GenerateContentResponse> {
        let contents = normalize_contents(input)?;
        let request = self.assemble_request(contents, opts);
        self.generate_request(request, opts).await
    }

    /// Generates content from a prepared request.
    pub async fn generate_request(
        &self,
        request: GenerateContentRequest,
        opts: &RequestOptions,
    ) -> Result<GenerateContentResponse> {
        let plan = self.plan(opts)?;
        let estimated = self.estimate_tokens(&request.contents, opts);
        let body = serde_json::to_value(&request)?;
        let reservation = self.reserve(&plan, estimated, opts).await?;

        let result = self
            .unary_with_retry(&plan, "generateContent", Method::POST, Some(body), opts)
            .await;
        match result {
            Ok(response) => {
                let response: GenerateContentResponse = response.json()?;
                let actual = response
                    .usage_metadata
                    .as_ref()
                    .map(|usage| usage.billed_tokens())
                    .unwrap_or(estimated);
                if let Some(reservation) = reservation {
                    reservation.commit(actual);
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    /// Counts tokens for the given input.
    pub async fn count_tokens(
        &self,
        input: impl Into<ContentInput>,
        opts: &RequestOptions,
    ) -> Result<CountTokensResponse> {
        let contents = normalize_contents(input)?;
        let plan = self.plan(opts)?;
        let body = serde_json::to_value(&CountTokensRequest { contents })?;
        let reservation = self.reserve(&plan, 0, opts).await?;
        let response = self
            .unary_with_retry(&plan, "countTokens", Method::POST, Some(body), opts)
            .await?;
        if let Some(reservation) = reservation {
            reservation.commit(0);
        }
        response.json()
    }

    /// Embeds a single content input.
    pub async fn embed_content(
        &self,
        input: impl Into<ContentInput>,
        opts: &RequestOptions,
    ) -> Result<EmbedContentResponse> {
        let mut contents = normalize_contents(input)?;
        if contents.len() != 1 {
            return Err(Error::validation("embed_content takes exactly one content"));
        }
        let plan = self.plan_for_use_case(opts, UseCase::Embedding)?;
        let request = EmbedContentRequest {
            model: Some(format!("models/{}", plan.model)),
            content: contents.remove(0),
            task_type: None,
            output_dimensionality: None,
        };
        let estimated = self.estimate_tokens(std::slice::from_ref(&request.content), opts);
        let body = serde_json::to_value(&request)?;
        let reservation = self.reserve(&plan, estimated, opts).await?;
        let response = self
            .unary_with_retry(&plan, "embedContent", Method::POST, Some(body), opts)
            .await?;
        if let Some(reservation) = reservation {
            reservation.commit(estimated);
        }
        response.json()
    }

    /// Embeds a batch of contents in one call.
    pub async fn batch_embed_contents(
        &self,
        inputs: Vec<ContentInput>,
        opts: &RequestOptions,
    ) -> Result<BatchEmbedContentsResponse> {
        let plan = self.plan_for_use_case(opts, UseCase::Embedding)?;
        let mut requests = Vec::with_capacity(inputs.len());
        let mut estimated = 0u32;
        for input in inputs {
            let mut contents = normalize_contents(input)?;
            if contents.len() != 1 {
                return Err(Error::validation(
                    "each batch entry must normalize to one content",
                ));
            }
            let content = contents.remove(0);
            estimated = estimated.saturating_add(estimate_content_tokens(
                std::slice::from_ref(&content),
            ));
            requests.push(EmbedContentRequest {
                model: Some(format!("models/{}", plan.model)),
                content,
                task_type: None,
                output_dimensionality: None,
            });
        }
        let body = serde_json::json!({ "requests": requests });
        let reservation = self.reserve(&plan, estimated, opts).await?;
        let response = self
            .unary_with_retry(&plan, "batchEmbedContents", Method::POST, Some(body), opts)
            .await?;
        if let Some(reservation) = reservation {
            reservation.commit(estimated);
        }
        response.json()
    }

    /// Lists available models.
    pub async fn list_models(&self, opts: &RequestOptions) -> Result<ListModelsResponse> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = models_collection_url(&auth, plan.strategy);
        let response = self
            .request_with_retry(&plan, url, Method::GET, None, opts)
            .await?;
        response.json()
    }

    /// Fetches one model's catalog entry.
    pub async fn get_model(&self, model: &str, opts: &RequestOptions) -> Result<Model> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = format!(
            "{}/{}",
            models_collection_url(&auth, plan.strategy),
            model.trim_start_matches("models/")
        );
        let response = self
            .request_with_retry(&plan, url, Method::GET, None, opts)
            .await?;
        response.json()
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Starts a server-streamed generation and subscribes to it.
    ///
    /// The stream worker holds the rate-limiter permit for the stream's
    /// lifetime; this caller does not reserve separately.
    #[instrument(skip_all, fields(model = ?opts.model))]
    pub async fn stream_generate(
        &self,
        input: impl Into<ContentInput>,
        opts: &RequestOptions,
    ) -> Result<Subscription> {
        let contents = normalize_contents(input)?;
        let request = self.assemble_request(contents, opts);
        self.stream_request(request, opts).await
    }

    /// Streams a prepared request.
    pub async fn stream_request(
        &self,
        request: GenerateContentRequest,
        opts: &RequestOptions,
    ) -> Result<Subscription> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let estimated = self.estimate_tokens(&request.contents, opts);
        let mut url = operation_url(&auth, plan.strategy, &plan.model, "streamGenerateContent");
        url.push_str("?alt=sse");

        let stream_request = StreamRequest {
            url,
            headers: auth.headers.clone(),
            body: serde_json::to_value(&request)?,
            timeout: plan.timeout,
            key: plan.key.clone(),
            estimated_tokens: estimated,
            key_settings: Some(plan.key_settings.clone()),
            max_retries: opts
                .max_retries
                .unwrap_or(self.inner.config.stream_max_retries),
            base_backoff: self.inner.config.base_backoff,
            max_backoff: opts.max_backoff.unwrap_or(self.inner.config.max_backoff),
        };
        let id = self.inner.streams.start(stream_request).await?;
        self.inner.streams.subscribe(id).await
    }

    /// The stream manager, for subscribe/stop/status on running streams.
    pub fn streams(&self) -> &StreamManager {
        &self.inner.streams
    }

    // ------------------------------------------------------------------
    // Live sessions
    // ------------------------------------------------------------------

    /// Opens a Live session for the configured model.
    pub async fn live_session(
        &self,
        mut config: LiveConfig,
        callbacks: LiveCallbacks,
        opts: &RequestOptions,
    ) -> Result<LiveSession> {
        let strategy = opts.auth.unwrap_or(self.inner.default_strategy);
        let auth = self.resolve_auth(strategy).await?;
        if config.setup.model.is_empty() {
            config.setup.model = self
                .inner
                .registry
                .resolve(UseCase::Live, strategy);
        }
        if !config.setup.model.starts_with("models/")
            && !config.setup.model.starts_with("projects/")
        {
            config.setup.model = match strategy {
                AuthStrategy::Gemini => format!("models/{}", config.setup.model),
                AuthStrategy::VertexAi => format!(
                    "projects/{}/locations/{}/publishers/google/models/{}",
                    auth.project_id.as_deref().unwrap_or_default(),
                    auth.location.as_deref().unwrap_or_default(),
                    config.setup.model
                ),
            };
        }
        let (url, headers) = live_endpoint(&auth, strategy);
        LiveSession::connect(&url, &headers, config, callbacks).await
    }

    // ------------------------------------------------------------------
    // Long-running operations
    // ------------------------------------------------------------------

    /// Fetches an operation resource by name.
    pub async fn get_operation(&self, name: &str, opts: &RequestOptions) -> Result<Operation> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = resource_url(&auth, plan.strategy, name);
        let response = self
            .request_with_retry(&plan, url, Method::GET, None, opts)
            .await?;
        response.json()
    }

    /// Polls an operation until terminal, with backoff and cancellation.
    pub async fn wait_for_operation(
        &self,
        name: &str,
        config: PollConfig,
        on_progress: Option<Box<dyn FnMut(&serde_json::Value) + Send>>,
        token: &PollToken,
        opts: &RequestOptions,
    ) -> Result<Operation> {
        let name = name.to_string();
        poll_operation(
            |_attempt| {
                let client = self.clone();
                let name = name.clone();
                let opts = opts.clone();
                async move { client.get_operation(&name, &opts).await }
            },
            config,
            on_progress,
            token,
        )
        .await
    }

    /// Requests cancellation of an operation (best effort).
    pub async fn cancel_operation(&self, name: &str, opts: &RequestOptions) -> Result<()> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = format!("{}:cancel", resource_url(&auth, plan.strategy, name));
        self.request_with_retry(&plan, url, Method::POST, Some(serde_json::json!({})), opts)
            .await?;
        Ok(())
    }

    /// Deletes a finished operation record (best effort).
    pub async fn delete_operation(&self, name: &str, opts: &RequestOptions) -> Result<()> {
        let plan = self.plan(opts)?;
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = resource_url(&auth, plan.strategy, name);
        self.request_with_retry(&plan, url, Method::DELETE, None, opts)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chat / tool calling
    // ------------------------------------------------------------------

    /// Runs the tool-calling loop for a chat session until the model
    /// produces a call-free response.
    pub async fn chat_send(
        &self,
        chat: &mut ChatSession,
        opts: &RequestOptions,
    ) -> Result<GenerateContentResponse> {
        let backend = BoundBackend {
            client: self.clone(),
            opts: opts.clone(),
        };
        crate::chat::run_tool_loop(&backend, chat).await
    }

    /// Streaming variant: buffers the first stream, runs tools when the
    /// model calls them, and proxies the follow-up stream.
    pub fn chat_stream(&self, chat: ChatSession, opts: RequestOptions) -> OrchestratedStream {
        let backend: Arc<dyn GenerateBackend> = Arc::new(BoundBackend {
            client: self.clone(),
            opts,
        });
        crate::chat::run_streaming_tool_loop(backend, chat)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn assemble_request(
        &self,
        contents: Vec<Content>,
        opts: &RequestOptions,
    ) -> GenerateContentRequest {
        GenerateContentRequest {
            contents,
            system_instruction: opts.system_instruction.clone(),
            tools: opts.tools.clone(),
            generation_config: opts.effective_generation_config(),
            safety_settings: opts.safety_settings.clone(),
            cached_content: opts.cached_content.clone(),
        }
    }

    fn plan(&self, opts: &RequestOptions) -> Result<RequestPlan> {
        self.plan_for_use_case(opts, UseCase::Flash)
    }

    fn plan_for_use_case(&self, opts: &RequestOptions, use_case: UseCase) -> Result<RequestPlan> {
        let strategy = opts.auth.unwrap_or(self.inner.default_strategy);
        if !self.inner.auth.supports(strategy) {
            return Err(Error::auth(
                strategy.to_string(),
                "no credentials configured for this strategy",
            ));
        }
        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| self.inner.registry.resolve(use_case, strategy));
        let key = opts.concurrency_key.clone().unwrap_or_else(|| model.clone());
        let config = &self.inner.config;
        Ok(RequestPlan {
            strategy,
            key,
            timeout: opts.timeout.unwrap_or(config.default_timeout),
            key_settings: KeySettings {
                max_permits: opts
                    .max_concurrency
                    .unwrap_or(config.max_concurrency_per_model),
                window_duration: config.window_duration,
                budget_total: opts
                    .token_budget_per_window
                    .or(config.token_budget_per_window),
                safety_multiplier: opts
                    .budget_safety_multiplier
                    .unwrap_or(config.budget_safety_multiplier),
            },
            model,
        })
    }

    fn estimate_tokens(&self, contents: &[Content], opts: &RequestOptions) -> u32 {
        let raw = opts
            .estimated_input_tokens
            .unwrap_or_else(|| estimate_content_tokens(contents));
        raw.saturating_sub(opts.estimated_cached_tokens.unwrap_or(0))
    }

    async fn reserve(
        &self,
        plan: &RequestPlan,
        tokens: u32,
        opts: &RequestOptions,
    ) -> Result<Option<Reservation>> {
        if opts.disable_rate_limiter {
            return Ok(None);
        }
        let mut request = ReserveRequest::new(plan.key.clone(), tokens)
            .with_settings(plan.key_settings.clone());
        if opts.non_blocking {
            request = request.non_blocking();
        } else {
            // Permit waits default to unbounded; budget-tracked keys fall
            // back to the budget wait bound so a full window cannot park a
            // caller forever.
            let deadline = opts
                .permit_timeout
                .or(self.inner.config.permit_timeout)
                .or_else(|| {
                    plan.key_settings.budget_total.map(|_| {
                        opts.max_budget_wait
                            .unwrap_or(self.inner.config.max_budget_wait)
                    })
                });
            if let Some(deadline) = deadline {
                request = request.with_deadline(deadline);
            }
        }
        let reservation = self.inner.limiter.try_reserve(request).await?;
        Ok(Some(reservation))
    }

    /// Resolves auth for a strategy, applying the endpoint override.
    async fn resolve_auth(&self, strategy: AuthStrategy) -> Result<ResolvedAuth> {
        let mut auth = self.inner.auth.resolve(strategy).await?;
        if let Some(endpoint) = &self.inner.endpoint_override {
            auth.base_url = endpoint.trim_end_matches('/').to_string();
        }
        Ok(auth)
    }

    async fn unary_with_retry(
        &self,
        plan: &RequestPlan,
        op: &str,
        method: Method,
        body: Option<serde_json::Value>,
        opts: &RequestOptions,
    ) -> Result<crate::http::HttpResponse> {
        let auth = self.resolve_auth(plan.strategy).await?;
        let url = operation_url(&auth, plan.strategy, &plan.model, op);
        self.request_with_retry(plan, url, method, body, opts).await
    }

    async fn request_with_retry(
        &self,
        plan: &RequestPlan,
        url: String,
        method: Method,
        body: Option<serde_json::Value>,
        opts: &RequestOptions,
    ) -> Result<crate::http::HttpResponse> {
        let config = &self.inner.config;
        let retry = RetryConfig {
            max_attempts: opts.max_retries.unwrap_or(config.max_retries).max(1),
            initial_delay: config.base_backoff,
            max_delay: opts.max_backoff.unwrap_or(config.max_backoff),
            backoff_multiplier: 2.0,
            jitter_factor: config.jitter_factor,
        };
        let key = plan.key.clone();
        let timeout = plan.timeout;
        let strategy = plan.strategy;

        retry_with_backoff_conditional(retry, || {
            let client = self.clone();
            let url = url.clone();
            let method = method.clone();
            let body = body.clone();
            let key = key.clone();
            async move {
                // Auth is resolved per attempt so a refreshed token is
                // picked up after an invalidation.
                let auth = client.resolve_auth(strategy).await?;
                let result = client
                    .inner
                    .transport
                    .do_json(method, &url, &auth.headers, body.as_ref(), timeout)
                    .await;
                match result {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        let err = classify_http_error(err);
                        match &err {
                            Error::RateLimited { retry_after, .. } => {
                                client.inner.limiter.record_error(&key, *retry_after);
                            }
                            Error::Http { status, .. } if matches!(status, 401 | 403) => {
                                debug!(status, "auth rejected; dropping cached token");
                                client.inner.auth.invalidate(strategy).await;
                            }
                            _ => {}
                        }
                        Err(err)
                    }
                }
            }
        })
        .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("default_strategy", &self.inner.default_strategy)
            .finish_non_exhaustive()
    }
}

/// Resolved routing decisions for one request.
#[derive(Debug, Clone)]
struct RequestPlan {
    strategy: AuthStrategy,
    model: String,
    key: String,
    timeout: Duration,
    key_settings: KeySettings,
}

/// Backend binding a client to a fixed set of request options, for the
/// orchestrator.
struct BoundBackend {
    client: Client,
    opts: RequestOptions,
}

#[async_trait]
impl GenerateBackend for BoundBackend {
    async fn generate(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        self.client.generate_request(request, &self.opts).await
    }

    async fn stream_generate(
        &self,
        request: GenerateContentRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut subscription = self.client.stream_request(request, &self.opts).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ----------------------------------------------------------------------
// URL assembly
// ----------------------------------------------------------------------

/// `{base}/{version}/models/{model}:{op}` or the Vertex publisher path,
/// with `{project_id}` and `{location}` substituted from resolved auth.
fn operation_url(auth: &ResolvedAuth, strategy: AuthStrategy, model: &str, op: &str) -> String {
    match strategy {
        AuthStrategy::Gemini => format!(
            "{}/{}/models/{}:{}",
            auth.base_url, GEMINI_API_VERSION, model, op
        ),
        AuthStrategy::VertexAi => format!(
            "{}/{}/projects/{}/locations/{}/publishers/google/models/{}:{}",
            auth.base_url,
            VERTEX_API_VERSION,
            auth.project_id.as_deref().unwrap_or_default(),
            auth.location.as_deref().unwrap_or_default(),
            model,
            op
        ),
    }
}

fn models_collection_url(auth: &ResolvedAuth, strategy: AuthStrategy) -> String {
    match strategy {
        AuthStrategy::Gemini => format!("{}/{}/models", auth.base_url, GEMINI_API_VERSION),
        AuthStrategy::VertexAi => format!(
            "{}/{}/projects/{}/locations/{}/publishers/google/models",
            auth.base_url,
            VERTEX_API_VERSION,
            auth.project_id.as_deref().unwrap_or_default(),
            auth.location.as_deref().unwrap_or_default(),
        ),
    }
}

/// `{base}/{version}/{resource}` for operation-style resource names.
fn resource_url(auth: &ResolvedAuth, strategy: AuthStrategy, name: &str) -> String {
    let version = match strategy {
        AuthStrategy::Gemini => GEMINI_API_VERSION,
        AuthStrategy::VertexAi => VERTEX_API_VERSION,
    };
    format!("{}/{}/{}", auth.base_url, version, name.trim_start_matches('/'))
}

/// Live endpoint URL plus connection headers. API-key auth travels as a
/// query parameter on the WebSocket URL; OAuth keeps its bearer header.
/// The WS scheme follows the base URL's (`http` maps to `ws`).
fn live_endpoint(auth: &ResolvedAuth, strategy: AuthStrategy) -> (String, Headers) {
    let (scheme, host) = match auth.base_url.strip_prefix("http://") {
        Some(host) => ("ws", host),
        None => (
            "wss",
            auth.base_url
                .strip_prefix("https://")
                .unwrap_or(&auth.base_url),
        ),
    };
    match strategy {
        AuthStrategy::Gemini => {
            let key = auth
                .headers
                .iter()
                .find(|(name, _)| name == "x-goog-api-key")
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            (
                format!("{scheme}://{host}{GEMINI_WS_PATH}?key={key}"),
                Vec::new(),
            )
        }
        AuthStrategy::VertexAi => (
            format!("{scheme}://{host}{VERTEX_WS_PATH}"),
            auth.headers.clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GEMINI_BASE_URL;

    fn gemini_auth() -> ResolvedAuth {
        ResolvedAuth {
            headers: vec![("x-goog-api-key".to_string(), "k".to_string())],
            base_url: GEMINI_BASE_URL.to_string(),
            project_id: None,
            location: None,
        }
    }

    fn vertex_auth() -> ResolvedAuth {
        ResolvedAuth {
            headers: vec![("authorization".to_string(), "Bearer t".to_string())],
            base_url: "https://us-central1-aiplatform.googleapis.com".to_string(),
            project_id: Some("my-project".to_string()),
            location: Some("us-central1".to_string()),
        }
    }

    fn test_client() -> Client {
        Client::builder()
            .api_key("test-key")
            .limiter(RateLimiter::new(Default::default()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_operation_url_gemini() {
        let url = operation_url(
            &gemini_auth(),
            AuthStrategy::Gemini,
            "gemini-2.0-flash",
            "generateContent",
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_operation_url_vertex_substitutes_templates() {
        let url = operation_url(
            &vertex_auth(),
            AuthStrategy::VertexAi,
            "gemini-2.0-flash",
            "generateContent",
        );
        assert_eq!(
            url,
            "https://us-central1-aiplatform.googleapis.com/v1/projects/my-project/locations/us-central1/publishers/google/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_resource_url() {
        assert_eq!(
            resource_url(&gemini_auth(), AuthStrategy::Gemini, "operations/abc"),
            "https://generativelanguage.googleapis.com/v1beta/operations/abc"
        );
    }

    #[test]
    fn test_live_endpoint_gemini_uses_query_key() {
        let (url, headers) = live_endpoint(&gemini_auth(), AuthStrategy::Gemini);
        assert!(url.starts_with(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage"
        ));
        assert!(url.ends_with("?key=k"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_live_endpoint_vertex_uses_bearer_header() {
        let (url, headers) = live_endpoint(&vertex_auth(), AuthStrategy::VertexAi);
        assert!(url.starts_with("wss://us-central1-aiplatform.googleapis.com/ws/"));
        assert!(!url.contains("key="));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "authorization");
    }

    #[test]
    fn test_builder_requires_credentials() {
        // No credentials and (typically) no env: expect an auth error. When
        // the environment does provide credentials, the build succeeds and
        // the assertion is skipped.
        if detect_strategy().is_none() {
            let err = Client::builder().build().unwrap_err();
            assert!(matches!(err, Error::Auth { .. }));
        }
    }

    #[tokio::test]
    async fn test_plan_defaults() {
        let client = test_client();
        let plan = client.plan(&RequestOptions::default()).unwrap();
        assert_eq!(plan.strategy, AuthStrategy::Gemini);
        assert_eq!(plan.model, "gemini-2.0-flash");
        assert_eq!(plan.key, "gemini-2.0-flash");
        assert_eq!(plan.timeout, Duration::from_millis(120_000));
        assert_eq!(plan.key_settings.max_permits, 4);
    }

    #[tokio::test]
    async fn test_plan_overrides() {
        let client = test_client();
        let opts = RequestOptions::new()
            .with_model("gemini-2.5-pro")
            .with_concurrency_key("tenant-7")
            .with_timeout(Duration::from_secs(10));
        let plan = client.plan(&opts).unwrap();
        assert_eq!(plan.model, "gemini-2.5-pro");
        assert_eq!(plan.key, "tenant-7");
        assert_eq!(plan.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_plan_rejects_unconfigured_strategy() {
        let client = test_client();
        let opts = RequestOptions::new().with_auth(AuthStrategy::VertexAi);
        assert!(matches!(client.plan(&opts), Err(Error::Auth { .. })));
    }

    #[tokio::test]
    async fn test_estimate_tokens_prefers_caller_value() {
        let client = test_client();
        let contents = vec![Content::user_text("a".repeat(400))];
        let heuristic = client.estimate_tokens(&contents, &RequestOptions::default());
        assert_eq!(heuristic, 100);

        let opts = RequestOptions::new().with_estimated_input_tokens(5);
        assert_eq!(client.estimate_tokens(&contents, &opts), 5);

        let opts = RequestOptions {
            estimated_input_tokens: Some(100),
            estimated_cached_tokens: Some(30),
            ..RequestOptions::default()
        };
        assert_eq!(client.estimate_tokens(&contents, &opts), 70);
    }

    #[test]
    fn test_effective_generation_config_merges_shortcuts() {
        let opts = RequestOptions {
            response_mime_type: Some("application/json".to_string()),
            response_json_schema: Some(serde_json::json!({"type": "object"})),
            ..RequestOptions::default()
        };
        let config = opts.effective_generation_config().unwrap();
        assert_eq!(config.response_mime_type.as_deref(), Some("application/json"));
        assert!(config.response_json_schema.is_some());

        // Shortcuts merge into an existing config without clobbering it.
        let opts = RequestOptions {
            generation_config: Some(GenerationConfig::new().with_temperature(0.1)),
            response_mime_type: Some("application/json".to_string()),
            ..RequestOptions::default()
        };
        let config = opts.effective_generation_config().unwrap();
        assert_eq!(config.temperature, Some(0.1));
        assert_eq!(config.response_mime_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_budget_over_limit_rejected_before_network() {
        // Request alone exceeds the window budget: immediate rejection, no
        // network involved (the fake key never resolves DNS).
        let client = Client::builder()
            .api_key("test-key")
            .limiter(RateLimiter::new(Default::default()))
            .config(ClientConfig::default().with_token_budget(1_000))
            .build()
            .unwrap();
        let opts = RequestOptions::new().with_estimated_input_tokens(2_000);
        let err = client.generate("hello", &opts).await.unwrap_err();
        match err {
            Error::Budget {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, crate::error::BudgetBlockedReason::OverBudget);
                assert_eq!(retry_after, None);
            }
            other => panic!("expected OverBudget, got {other:?}"),
        }
    }
}
