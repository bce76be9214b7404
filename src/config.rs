//! # Configuration for the Gemini client
//!
//! This module defines the process-wide knobs, the auth strategy selection
//! (including environment-variable detection), and the model registry that
//! maps use-case aliases to concrete model ids per auth strategy.
//!
//! ## Environment Variables
//!
//! Strategy selection checks, in order:
//!
//! - `GEMINI_API_KEY`: API-key strategy against the REST endpoint
//! - `VERTEX_SERVICE_ACCOUNT_FILE`: OAuth strategy from a key file
//! - `VERTEX_JSON_CONTENT`: OAuth strategy from an inline JSON blob
//! - `VERTEX_PROJECT_ID` + `VERTEX_LOCATION`: OAuth strategy via
//!   application-default credentials or the metadata server
//!
//! ## Examples
//!
//! ```rust
//! use gemini_client::{AuthStrategy, ClientConfig, ModelRegistry, UseCase};
//!
//! let config = ClientConfig::default();
//! assert_eq!(config.max_retries, 3);
//!
//! let registry = ModelRegistry::new();
//! let model = registry.resolve(UseCase::Flash, AuthStrategy::Gemini);
//! assert!(!model.is_empty());
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which authentication backend a request is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStrategy {
    /// API-key auth against the `generativelanguage` REST endpoint.
    Gemini,
    /// OAuth2 service-account auth against the regional Vertex endpoint.
    VertexAi,
}

impl FromStr for AuthStrategy {
    type Err = String;

    /// Parse a strategy name, case-insensitively, accepting the common
    /// spellings (`gemini`, `vertex`, `vertex-ai`, `vertex_ai`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(AuthStrategy::Gemini),
            "vertex" | "vertex-ai" | "vertex_ai" | "vertexai" => Ok(AuthStrategy::VertexAi),
            _ => Err(format!("Unknown auth strategy: {s}")),
        }
    }
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::Gemini => write!(f, "gemini"),
            AuthStrategy::VertexAi => write!(f, "vertex_ai"),
        }
    }
}

/// Detects the auth strategy from the environment.
///
/// Returns `None` when no credential-bearing variable is set.
pub fn detect_strategy() -> Option<AuthStrategy> {
    if env::var("GEMINI_API_KEY").is_ok_and(|v| !v.is_empty()) {
        return Some(AuthStrategy::Gemini);
    }
    let vertex_vars = [
        "VERTEX_SERVICE_ACCOUNT_FILE",
        "VERTEX_JSON_CONTENT",
        "VERTEX_PROJECT_ID",
    ];
    if vertex_vars
        .iter()
        .any(|var| env::var(var).is_ok_and(|v| !v.is_empty()))
    {
        return Some(AuthStrategy::VertexAi);
    }
    None
}

/// Process-wide defaults for timeouts, retries, and the rate limiter.
///
/// Every field can be overridden per request through `RequestOptions`; this
/// struct is the fallback layer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-attempt request timeout.
    pub default_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Retry attempts for 429/5xx/transport failures.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound on any single backoff sleep.
    pub max_backoff: Duration,
    /// Fractional jitter applied to every backoff sleep (±).
    pub jitter_factor: f64,
    /// Permits per concurrency key.
    pub max_concurrency_per_model: u32,
    /// How long a blocking reserve may wait for a permit. `None` = forever.
    pub permit_timeout: Option<Duration>,
    /// Budget window length.
    pub window_duration: Duration,
    /// Token budget per window per key. `None` disables budget tracking.
    pub token_budget_per_window: Option<u32>,
    /// Single-request ceiling as a multiple of the window budget.
    pub budget_safety_multiplier: f64,
    /// Longest a blocking reserve waits on a full budget.
    pub max_budget_wait: Duration,
    /// Whether the limiter adapts permit counts to observed 429s.
    pub adaptive_concurrency: bool,
    /// Ceiling for adaptive permit growth.
    pub adaptive_ceiling: u32,
    /// How long finished SSE streams stay queryable.
    pub stream_cleanup_delay: Duration,
    /// Subscriber-side gap timeout between SSE chunks.
    pub stream_receive_timeout: Duration,
    /// Reconnect attempts for an SSE stream that has not yet delivered.
    pub stream_max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(120_000),
            connect_timeout: Duration::from_millis(5_000),
            max_retries: 3,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(10_000),
            jitter_factor: 0.25,
            max_concurrency_per_model: 4,
            permit_timeout: None,
            window_duration: Duration::from_millis(60_000),
            token_budget_per_window: None,
            budget_safety_multiplier: 1.0,
            max_budget_wait: Duration::from_millis(60_000),
            adaptive_concurrency: false,
            adaptive_ceiling: 8,
            stream_cleanup_delay: Duration::from_millis(30_000),
            stream_receive_timeout: Duration::from_millis(30_000),
            stream_max_retries: 3,
        }
    }
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the per-key permit count.
    pub fn with_max_concurrency(mut self, permits: u32) -> Self {
        self.max_concurrency_per_model = permits;
        self
    }

    /// Enables the token budget with the given per-window total.
    pub fn with_token_budget(mut self, budget: u32) -> Self {
        self.token_budget_per_window = Some(budget);
        self
    }

    /// Enables adaptive concurrency.
    pub fn with_adaptive_concurrency(mut self, ceiling: u32) -> Self {
        self.adaptive_concurrency = true;
        self.adaptive_ceiling = ceiling;
        self
    }
}

// ============================================================================
// MODEL REGISTRY
// ============================================================================

/// Use-case aliases callers can resolve instead of naming a model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseCase {
    /// Balanced default for interactive work.
    Flash,
    /// Cheapest/fastest tier.
    FlashLite,
    /// Highest-quality tier.
    Pro,
    /// Text embeddings.
    Embedding,
    /// Live (bidirectional audio/video) sessions.
    Live,
}

impl FromStr for UseCase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flash" => Ok(UseCase::Flash),
            "flash-lite" | "flash_lite" | "flashlite" | "lite" => Ok(UseCase::FlashLite),
            "pro" => Ok(UseCase::Pro),
            "embedding" | "embed" => Ok(UseCase::Embedding),
            "live" => Ok(UseCase::Live),
            _ => Err(format!("Unknown use case: {s}")),
        }
    }
}

/// Auth-aware mapping from use case to model id.
///
/// The two endpoint families expose overlapping but not identical model
/// catalogs, so the default for a use case depends on the active strategy.
/// The table here is overridable per entry for deployments that pin models.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    overrides: Vec<(UseCase, AuthStrategy, String)>,
}

impl ModelRegistry {
    /// Creates a registry with the built-in defaults.
    pub fn new() -> Self {
        Self {
            overrides: Vec::new(),
        }
    }

    /// Pins a model id for a use case under one strategy.
    pub fn with_override(
        mut self,
        use_case: UseCase,
        strategy: AuthStrategy,
        model: impl Into<String>,
    ) -> Self {
        self.overrides.push((use_case, strategy, model.into()));
        self
    }

    /// Resolves a use case to a model id for the given strategy.
    pub fn resolve(&self, use_case: UseCase, strategy: AuthStrategy) -> String {
        if let Some((_, _, model)) = self
            .overrides
            .iter()
            .rev()
            .find(|(u, s, _)| *u == use_case && *s == strategy)
        {
            return model.clone();
        }
        Self::builtin_default(use_case, strategy).to_string()
    }

    /// Default model for a strategy when the caller names neither a model
    /// nor a use case.
    pub fn default_model(&self, strategy: AuthStrategy) -> String {
        self.resolve(UseCase::Flash, strategy)
    }

    fn builtin_default(use_case: UseCase, strategy: AuthStrategy) -> &'static str {
        match (use_case, strategy) {
            (UseCase::Flash, _) => "gemini-2.0-flash",
            (UseCase::FlashLite, _) => "gemini-2.0-flash-lite",
            (UseCase::Pro, AuthStrategy::Gemini) => "gemini-2.5-pro",
            (UseCase::Pro, AuthStrategy::VertexAi) => "gemini-2.5-pro",
            (UseCase::Embedding, AuthStrategy::Gemini) => "text-embedding-004",
            (UseCase::Embedding, AuthStrategy::VertexAi) => "text-embedding-005",
            (UseCase::Live, _) => "gemini-2.0-flash-live-001",
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("gemini".parse::<AuthStrategy>().unwrap(), AuthStrategy::Gemini);
        assert_eq!(
            "Vertex-AI".parse::<AuthStrategy>().unwrap(),
            AuthStrategy::VertexAi
        );
        assert_eq!(
            "vertex_ai".parse::<AuthStrategy>().unwrap(),
            AuthStrategy::VertexAi
        );
        assert!("openai".parse::<AuthStrategy>().is_err());
    }

    #[test]
    fn test_config_defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.default_timeout, Duration::from_millis(120_000));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_backoff, Duration::from_millis(1_000));
        assert_eq!(config.max_backoff, Duration::from_millis(10_000));
        assert_eq!(config.connect_timeout, Duration::from_millis(5_000));
        assert_eq!(config.jitter_factor, 0.25);
        assert_eq!(config.max_concurrency_per_model, 4);
        assert_eq!(config.permit_timeout, None);
        assert_eq!(config.window_duration, Duration::from_millis(60_000));
        assert_eq!(config.budget_safety_multiplier, 1.0);
        assert!(!config.adaptive_concurrency);
        assert_eq!(config.adaptive_ceiling, 8);
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .with_timeout(Duration::from_secs(10))
            .with_max_retries(5)
            .with_max_concurrency(2)
            .with_token_budget(1_000)
            .with_adaptive_concurrency(16);
        assert_eq!(config.default_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_concurrency_per_model, 2);
        assert_eq!(config.token_budget_per_window, Some(1_000));
        assert!(config.adaptive_concurrency);
        assert_eq!(config.adaptive_ceiling, 16);
    }

    #[test]
    fn test_use_case_from_str() {
        assert_eq!("flash".parse::<UseCase>().unwrap(), UseCase::Flash);
        assert_eq!("flash-lite".parse::<UseCase>().unwrap(), UseCase::FlashLite);
        assert_eq!("embed".parse::<UseCase>().unwrap(), UseCase::Embedding);
        assert!("turbo".parse::<UseCase>().is_err());
    }

    #[test]
    fn test_registry_defaults_are_auth_aware() {
        let registry = ModelRegistry::new();
        assert_eq!(
            registry.resolve(UseCase::Embedding, AuthStrategy::Gemini),
            "text-embedding-004"
        );
        assert_eq!(
            registry.resolve(UseCase::Embedding, AuthStrategy::VertexAi),
            "text-embedding-005"
        );
        assert_eq!(
            registry.default_model(AuthStrategy::Gemini),
            "gemini-2.0-flash"
        );
    }

    #[test]
    fn test_registry_override_wins() {
        let registry = ModelRegistry::new().with_override(
            UseCase::Flash,
            AuthStrategy::Gemini,
            "gemini-custom",
        );
        assert_eq!(
            registry.resolve(UseCase::Flash, AuthStrategy::Gemini),
            "gemini-custom"
        );
        // Other strategy keeps the builtin default.
        assert_eq!(
            registry.resolve(UseCase::Flash, AuthStrategy::VertexAi),
            "gemini-2.0-flash"
        );
    }
}
