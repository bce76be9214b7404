//! Authentication multiplexer.
//!
//! Two credential backends feed one request surface:
//!
//! - **API key** (`AuthStrategy::Gemini`): a static `x-goog-api-key` header
//!   against the fixed REST endpoint. No refresh.
//! - **OAuth service account** (`AuthStrategy::VertexAi`): a Bearer token
//!   against the regional endpoint. Tokens are minted from the first usable
//!   source in the order key file → env JSON blob → application-default
//!   credentials → metadata server, cached until shortly before expiry, and
//!   refreshed under a single-flight lock so concurrent callers share one
//!   exchange.
//!
//! [`AuthMux::resolve`] returns ready-to-apply headers plus the base URL for
//! the strategy; it never logs credential material.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AuthStrategy;
use crate::{Error, Result};

/// Fixed REST endpoint for API-key auth.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// OAuth token exchange endpoint.
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Metadata-server token endpoint (GCE/GKE ambient credentials).
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Scope requested for every minted token.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Tokens are refreshed this long before their reported expiry.
const REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Where OAuth credential material comes from, tried in declaration order.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Service-account key file on disk.
    KeyFile(PathBuf),
    /// Service-account JSON passed inline (e.g. from an env var).
    JsonBlob(String),
    /// `application_default_credentials.json` from gcloud.
    Adc,
    /// The GCE/GKE metadata server.
    MetadataServer,
}

impl CredentialSource {
    fn kind(&self) -> &'static str {
        match self {
            CredentialSource::KeyFile(_) => "key_file",
            CredentialSource::JsonBlob(_) => "json_blob",
            CredentialSource::Adc => "adc",
            CredentialSource::MetadataServer => "metadata_server",
        }
    }
}

/// The JSON blob variant can carry a private key; only the source kind is
/// ever printed.
impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::KeyFile(path) => {
                f.debug_tuple("KeyFile").field(path).finish()
            }
            CredentialSource::JsonBlob(_) => f.debug_tuple("JsonBlob").field(&"***").finish(),
            CredentialSource::Adc => write!(f, "Adc"),
            CredentialSource::MetadataServer => write!(f, "MetadataServer"),
        }
    }
}

/// A minted access token and when it stops being trustworthy.
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// The bearer token value.
    pub value: String,
    /// Instant past which the token must not be used.
    pub expires_at: Instant,
}

impl CachedToken {
    /// A token is fresh while more than the refresh skew remains.
    pub fn is_fresh(&self) -> bool {
        self.expires_at
            .checked_duration_since(Instant::now())
            .is_some_and(|left| left > REFRESH_SKEW)
    }
}

/// Credentials for one auth strategy.
#[derive(Clone)]
pub enum Credentials {
    /// Static API key.
    ApiKey {
        /// The key value.
        key: String,
    },
    /// OAuth service-account identity bound to a project and region.
    OAuth {
        /// Cloud project id substituted into request paths.
        project_id: String,
        /// Region substituted into the endpoint host and request paths.
        location: String,
        /// Ordered credential sources to try.
        sources: Vec<CredentialSource>,
    },
}

/// Masks the key so credentials never land in logs verbatim.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey { .. } => {
                f.debug_struct("ApiKey").field("key", &"***").finish()
            }
            Credentials::OAuth {
                project_id,
                location,
                sources,
            } => f
                .debug_struct("OAuth")
                .field("project_id", project_id)
                .field("location", location)
                .field(
                    "sources",
                    &sources.iter().map(|s| s.kind()).collect::<Vec<_>>(),
                )
                .finish(),
        }
    }
}

impl Credentials {
    /// Creates API-key credentials.
    pub fn api_key(key: impl Into<String>) -> Self {
        Credentials::ApiKey { key: key.into() }
    }

    /// Creates OAuth credentials with the default source order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `project_id` or `location` is
    /// empty; an OAuth credential without both is unusable.
    pub fn oauth(project_id: impl Into<String>, location: impl Into<String>) -> Result<Self> {
        let project_id = project_id.into();
        let location = location.into();
        if project_id.trim().is_empty() || location.trim().is_empty() {
            return Err(Error::validation(
                "OAuth credentials require both project_id and location",
            ));
        }
        Ok(Credentials::OAuth {
            project_id,
            location,
            sources: vec![CredentialSource::Adc, CredentialSource::MetadataServer],
        })
    }

    /// Creates OAuth credentials pinned to a service-account key file.
    pub fn oauth_from_key_file(
        project_id: impl Into<String>,
        location: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut creds = Self::oauth(project_id, location)?;
        if let Credentials::OAuth { sources, .. } = &mut creds {
            sources.insert(0, CredentialSource::KeyFile(path.into()));
        }
        Ok(creds)
    }

    /// Builds credentials from the environment, mirroring
    /// [`crate::config::detect_strategy`].
    pub fn from_env(strategy: AuthStrategy) -> Result<Self> {
        match strategy {
            AuthStrategy::Gemini => {
                let key = std::env::var("GEMINI_API_KEY")
                    .map_err(|_| Error::auth("api_key", "GEMINI_API_KEY is not set"))?;
                Ok(Credentials::api_key(key))
            }
            AuthStrategy::VertexAi => {
                let project_id = std::env::var("VERTEX_PROJECT_ID")
                    .map_err(|_| Error::auth("oauth", "VERTEX_PROJECT_ID is not set"))?;
                let location = std::env::var("VERTEX_LOCATION")
                    .map_err(|_| Error::auth("oauth", "VERTEX_LOCATION is not set"))?;
                let mut sources = Vec::new();
                if let Ok(path) = std::env::var("VERTEX_SERVICE_ACCOUNT_FILE") {
                    sources.push(CredentialSource::KeyFile(PathBuf::from(path)));
                }
                if let Ok(blob) = std::env::var("VERTEX_JSON_CONTENT") {
                    sources.push(CredentialSource::JsonBlob(blob));
                }
                sources.push(CredentialSource::Adc);
                sources.push(CredentialSource::MetadataServer);
                Ok(Credentials::OAuth {
                    project_id,
                    location,
                    sources,
                })
            }
        }
    }
}

/// Resolved auth material for one request.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    /// Headers to attach (name, value). Values are never logged.
    pub headers: Vec<(String, String)>,
    /// Scheme + host for the strategy's endpoint.
    pub base_url: String,
    /// Project id for path-template substitution (OAuth only).
    pub project_id: Option<String>,
    /// Location for path-template substitution (OAuth only).
    pub location: Option<String>,
}

/// Service-account key file payload (the fields we use).
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Authorized-user (ADC) payload.
#[derive(Debug, Deserialize)]
struct AuthorizedUserKey {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

/// JWT claim set for the service-account grant.
#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

impl JwtClaims {
    fn for_service_account(email: &str, aud: &str, now: u64) -> Self {
        Self {
            iss: email.to_string(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            aud: aud.to_string(),
            iat: now,
            exp: now + 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// The multiplexer: holds credentials per strategy and a token cache.
///
/// Cloning is cheap and shares the cache.
pub struct AuthMux {
    http: reqwest::Client,
    credentials: HashMap<AuthStrategy, Credentials>,
    // Single async mutex doubles as the single-flight lock: a refresh holds
    // it for the duration of the exchange, so concurrent resolvers wait and
    // then observe the fresh cache instead of racing their own exchange.
    tokens: Mutex<HashMap<AuthStrategy, CachedToken>>,
}

impl AuthMux {
    /// Creates a multiplexer with the given per-strategy credentials.
    pub fn new(credentials: HashMap<AuthStrategy, Credentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a multiplexer for a single strategy.
    pub fn single(strategy: AuthStrategy, credentials: Credentials) -> Self {
        let mut map = HashMap::new();
        map.insert(strategy, credentials);
        Self::new(map)
    }

    /// Whether credentials are configured for a strategy.
    pub fn supports(&self, strategy: AuthStrategy) -> bool {
        self.credentials.contains_key(&strategy)
    }

    /// Resolves headers and base URL for the strategy, minting or refreshing
    /// a token when needed. Safe to call concurrently.
    pub async fn resolve(&self, strategy: AuthStrategy) -> Result<ResolvedAuth> {
        let credentials = self.credentials.get(&strategy).ok_or_else(|| {
            Error::auth(
                strategy.to_string(),
                "no credentials configured for this strategy",
            )
        })?;

        match credentials {
            Credentials::ApiKey { key } => Ok(ResolvedAuth {
                headers: vec![("x-goog-api-key".to_string(), key.clone())],
                base_url: GEMINI_BASE_URL.to_string(),
                project_id: None,
                location: None,
            }),
            Credentials::OAuth {
                project_id,
                location,
                sources,
            } => {
                let token = self.fresh_token(strategy, sources).await?;
                Ok(ResolvedAuth {
                    headers: vec![("authorization".to_string(), format!("Bearer {token}"))],
                    base_url: vertex_base_url(location),
                    project_id: Some(project_id.clone()),
                    location: Some(location.clone()),
                })
            }
        }
    }

    /// Drops the cached token for a strategy so the next resolve re-mints.
    pub async fn invalidate(&self, strategy: AuthStrategy) {
        self.tokens.lock().await.remove(&strategy);
    }

    async fn fresh_token(
        &self,
        strategy: AuthStrategy,
        sources: &[CredentialSource],
    ) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&strategy) {
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        // One local retry before surfacing; transient exchange failures are
        // common enough at process start.
        let minted = match self.mint_token(sources).await {
            Ok(minted) => minted,
            Err(first) => {
                warn!(error = %first, "token exchange failed, retrying once");
                self.mint_token(sources).await?
            }
        };
        tokens.insert(strategy, minted.clone());
        Ok(minted.value)
    }

    async fn mint_token(&self, sources: &[CredentialSource]) -> Result<CachedToken> {
        let mut last_err: Option<Error> = None;
        for source in sources {
            match self.mint_from_source(source).await {
                Ok(token) => {
                    debug!(source = source.kind(), "minted access token");
                    return Ok(token);
                }
                Err(err) => {
                    debug!(source = source.kind(), error = %err, "credential source unusable");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::auth("oauth", "no credential sources configured")))
    }

    async fn mint_from_source(&self, source: &CredentialSource) -> Result<CachedToken> {
        match source {
            CredentialSource::KeyFile(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::auth("key_file", format!("cannot read {}: {e}", path.display()))
                })?;
                self.mint_from_json(&raw, "key_file").await
            }
            CredentialSource::JsonBlob(blob) => self.mint_from_json(blob, "json_blob").await,
            CredentialSource::Adc => {
                let path = adc_path()
                    .ok_or_else(|| Error::auth("adc", "cannot locate the gcloud config dir"))?;
                let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::auth("adc", format!("cannot read {}: {e}", path.display()))
                })?;
                self.mint_from_json(&raw, "adc").await
            }
            CredentialSource::MetadataServer => self.mint_from_metadata_server().await,
        }
    }

    /// Dispatches on the credential JSON's `type` field: service accounts go
    /// through the signed-JWT grant, authorized users through a refresh-token
    /// grant.
    async fn mint_from_json(&self, raw: &str, kind: &'static str) -> Result<CachedToken> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::auth(kind, format!("credential JSON is invalid: {e}")))?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("service_account") => {
                let key: ServiceAccountKey = serde_json::from_value(value)
                    .map_err(|e| Error::auth(kind, format!("malformed service account: {e}")))?;
                self.exchange_service_account(&key, kind).await
            }
            Some("authorized_user") => {
                let key: AuthorizedUserKey = serde_json::from_value(value)
                    .map_err(|e| Error::auth(kind, format!("malformed authorized user: {e}")))?;
                self.exchange_refresh_token(&key, kind).await
            }
            other => Err(Error::auth(
                kind,
                format!("unsupported credential type {other:?}"),
            )),
        }
    }

    async fn exchange_service_account(
        &self,
        key: &ServiceAccountKey,
        kind: &'static str,
    ) -> Result<CachedToken> {
        let aud = key.token_uri.as_deref().unwrap_or(TOKEN_URI);
        let now = unix_now();
        let claims = JwtClaims::for_service_account(&key.client_email, aud, now);
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::auth(kind, format!("private key rejected: {e}")))?;
        let assertion = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| Error::auth(kind, format!("JWT signing failed: {e}")))?;

        let response = self
            .http
            .post(aud)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::auth(kind, format!("token endpoint unreachable: {e}")))?;
        Self::token_from_response(response, kind).await
    }

    async fn exchange_refresh_token(
        &self,
        key: &AuthorizedUserKey,
        kind: &'static str,
    ) -> Result<CachedToken> {
        let response = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", key.client_id.as_str()),
                ("client_secret", key.client_secret.as_str()),
                ("refresh_token", key.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::auth(kind, format!("token endpoint unreachable: {e}")))?;
        Self::token_from_response(response, kind).await
    }

    async fn mint_from_metadata_server(&self) -> Result<CachedToken> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| {
                Error::auth("metadata_server", format!("metadata server unreachable: {e}"))
            })?;
        Self::token_from_response(response, "metadata_server").await
    }

    async fn token_from_response(
        response: reqwest::Response,
        kind: &'static str,
    ) -> Result<CachedToken> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::auth(kind, format!("token response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(Error::auth(
                kind,
                format!("token exchange returned {status}: {body}"),
            ));
        }
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::auth(kind, format!("token response malformed: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

impl std::fmt::Debug for AuthMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMux")
            .field(
                "strategies",
                &self.credentials.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Regional Vertex endpoint for a location.
pub fn vertex_base_url(location: &str) -> String {
    format!("https://{location}-aiplatform.googleapis.com")
}

fn adc_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("gcloud")
            .join("application_default_credentials.json"),
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_requires_project_and_location() {
        assert!(Credentials::oauth("", "us-central1").is_err());
        assert!(Credentials::oauth("my-project", "").is_err());
        assert!(Credentials::oauth("my-project", "us-central1").is_ok());
    }

    #[test]
    fn test_key_file_source_ordering() {
        let creds =
            Credentials::oauth_from_key_file("my-project", "us-central1", "/tmp/sa.json").unwrap();
        let Credentials::OAuth { sources, .. } = creds else {
            panic!("expected OAuth credentials");
        };
        assert!(matches!(sources[0], CredentialSource::KeyFile(_)));
        assert!(matches!(sources[1], CredentialSource::Adc));
        assert!(matches!(sources[2], CredentialSource::MetadataServer));
    }

    #[test]
    fn test_cached_token_freshness() {
        let fresh = CachedToken {
            value: "t".to_string(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        assert!(fresh.is_fresh());

        // Inside the refresh skew counts as stale.
        let nearly_expired = CachedToken {
            value: "t".to_string(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!nearly_expired.is_fresh());
    }

    #[test]
    fn test_jwt_claims_shape() {
        let claims = JwtClaims::for_service_account("sa@proj.iam.gserviceaccount.com", TOKEN_URI, 1_000);
        assert_eq!(claims.iss, "sa@proj.iam.gserviceaccount.com");
        assert_eq!(claims.aud, TOKEN_URI);
        assert_eq!(claims.scope, CLOUD_PLATFORM_SCOPE);
        assert_eq!(claims.exp, claims.iat + 3600);
    }

    #[test]
    fn test_vertex_base_url() {
        assert_eq!(
            vertex_base_url("us-central1"),
            "https://us-central1-aiplatform.googleapis.com"
        );
    }

    #[tokio::test]
    async fn test_resolve_api_key_headers() {
        let mux = AuthMux::single(AuthStrategy::Gemini, Credentials::api_key("secret"));
        let resolved = mux.resolve(AuthStrategy::Gemini).await.unwrap();
        assert_eq!(resolved.base_url, GEMINI_BASE_URL);
        assert_eq!(
            resolved.headers,
            vec![("x-goog-api-key".to_string(), "secret".to_string())]
        );
        assert!(resolved.project_id.is_none());
    }

    #[tokio::test]
    async fn test_resolve_unconfigured_strategy_fails() {
        let mux = AuthMux::single(AuthStrategy::Gemini, Credentials::api_key("secret"));
        let err = mux.resolve(AuthStrategy::VertexAi).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn test_debug_hides_credentials() {
        let mux = AuthMux::single(AuthStrategy::Gemini, Credentials::api_key("super-secret"));
        let rendered = format!("{mux:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
