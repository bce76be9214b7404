//! Integration tests for the Gemini client
//!
//! These tests verify that different modules work together correctly.

use gemini_client::{
    AuthStrategy, ChatSession, Client, ClientConfig, Content, Credentials, GenerationConfig,
    LimiterSettings, ModelRegistry, Part, RateLimiter, RequestOptions, Role, ToolRegistry,
    UseCase, tool,
};

#[test]
fn test_chat_session_with_tools() {
    let calculator = tool("add", "Add two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!({"result": a + b}))
        });

    let mut registry = ToolRegistry::new();
    registry.register(calculator);

    let chat = ChatSession::new()
        .with_system_instruction("You are a calculator assistant")
        .with_tools(registry);

    assert_eq!(chat.tools().len(), 1);
    assert!(chat.tools().get("add").is_some());

    let request = chat.to_request();
    assert!(request.system_instruction.is_some());
    assert_eq!(request.tools.len(), 1);
}

#[test]
fn test_chat_request_carries_history_in_order() {
    let mut chat = ChatSession::new().with_generation_config(
        GenerationConfig::new().with_temperature(0.2),
    );
    chat.push_user_text("first");
    chat.push_turn(Content::model(vec![Part::text("reply")]));
    chat.push_user_text("second");

    let request = chat.to_request();
    assert_eq!(request.contents.len(), 3);
    assert_eq!(request.contents[0].role, Some(Role::User));
    assert_eq!(request.contents[1].role, Some(Role::Model));
    assert_eq!(request.contents[2].text(), "second");
    assert_eq!(
        request.generation_config.as_ref().unwrap().temperature,
        Some(0.2)
    );
}

#[tokio::test]
async fn test_client_builder_with_explicit_credentials() {
    let client = Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("k"))
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .build()
        .unwrap();
    assert_eq!(client.default_strategy(), AuthStrategy::Gemini);
}

#[tokio::test]
async fn test_client_builder_prefers_api_key_strategy() {
    let client = Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("k"))
        .credentials(
            AuthStrategy::VertexAi,
            Credentials::oauth("proj", "us-central1").unwrap(),
        )
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .build()
        .unwrap();
    assert_eq!(client.default_strategy(), AuthStrategy::Gemini);
}

#[tokio::test]
async fn test_registry_flows_through_client() {
    let registry = ModelRegistry::new().with_override(
        UseCase::Flash,
        AuthStrategy::Gemini,
        "pinned-model",
    );
    let client = Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("k"))
        .registry(registry)
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .build()
        .unwrap();
    assert_eq!(
        client
            .registry()
            .resolve(UseCase::Flash, AuthStrategy::Gemini),
        "pinned-model"
    );
}

#[tokio::test]
async fn test_config_flows_through_builder() {
    let config = ClientConfig::new()
        .with_max_retries(7)
        .with_max_concurrency(2);
    let client = Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("k"))
        .config(config)
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .build()
        .unwrap();
    // Construction succeeds; the config is observable through behavior
    // (covered by the end-to-end suite), so this just guards the wiring.
    assert_eq!(client.default_strategy(), AuthStrategy::Gemini);
}

#[test]
fn test_content_round_trip_preserves_turns_and_roles() {
    let turns = vec![
        Content::user_text("hello"),
        Content::model(vec![Part::text("hi there")]),
        Content::user(vec![
            Part::text("look"),
            Part::inline_data(&[0xFF, 0xD8, 0xFF], None).unwrap(),
        ]),
    ];
    let wire = serde_json::to_string(&turns).unwrap();
    let back: Vec<Content> = serde_json::from_str(&wire).unwrap();
    assert_eq!(back, turns);
    assert_eq!(back.len(), 3);
    assert_eq!(back[0].role, Some(Role::User));
    assert_eq!(back[1].role, Some(Role::Model));
}

#[test]
fn test_options_builder_chain() {
    let opts = RequestOptions::new()
        .with_model("gemini-2.5-pro")
        .with_auth(AuthStrategy::Gemini)
        .with_system_instruction("be brief")
        .with_estimated_input_tokens(128)
        .with_concurrency_key("tenant-1")
        .non_blocking();
    assert_eq!(opts.model.as_deref(), Some("gemini-2.5-pro"));
    assert_eq!(opts.auth, Some(AuthStrategy::Gemini));
    assert!(opts.system_instruction.is_some());
    assert_eq!(opts.estimated_input_tokens, Some(128));
    assert_eq!(opts.concurrency_key.as_deref(), Some("tenant-1"));
    assert!(opts.non_blocking);
}
