//! End-to-end flows against an in-process fake server.
//!
//! Every test builds a client whose endpoint points at a local TCP
//! listener serving canned responses, so the full request path runs: auth
//! header assembly, rate-limiter reservation, transport, retry
//! classification, and response parsing.

mod common;

use std::time::Duration;

use gemini_client::{
    AuthStrategy, Client, ClientConfig, Credentials, Error, LimiterSettings, RateLimiter,
    RequestOptions, StreamEvent,
};

use common::{error_response, json_response, spawn_http_server, sse_response};

fn client_for(addr: std::net::SocketAddr, config: ClientConfig) -> Client {
    Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("test-key"))
        .endpoint(format!("http://{addr}"))
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .config(config)
        .build()
        .unwrap()
}

#[tokio::test]
async fn unary_generate_with_api_key_auth() {
    let body = r#"{
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "2+2 equals 4."}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 8, "totalTokenCount": 14}
    }"#;
    let addr = spawn_http_server(vec![json_response(body)]).await;
    let client = client_for(addr, ClientConfig::default());

    let opts = RequestOptions::new().with_model("flash-lite");
    let response = client.generate("What is 2+2?", &opts).await.unwrap();

    assert!(response.text().unwrap().contains('4'));
    assert_eq!(response.finish_reason(), Some("STOP"));

    // The reservation was committed with the response's actual usage.
    let snapshot = client.limiter().snapshot("flash-lite").await.unwrap();
    assert_eq!(snapshot.in_use, 0);
    assert_eq!(snapshot.reserved_tokens, 0);
    assert_eq!(snapshot.used_tokens, 14);
}

#[tokio::test]
async fn sse_stream_delivers_chunks_in_order() {
    let addr = spawn_http_server(vec![sse_response(&[
        r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
        r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]}}]}"#,
    ])])
    .await;
    let client = client_for(addr, ClientConfig::default());

    let mut stream = client
        .stream_generate("say hello", &RequestOptions::new().with_model("flash-lite"))
        .await
        .unwrap();

    let mut texts = Vec::new();
    let mut completed = false;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Chunk(chunk) => texts.push(chunk.text().unwrap_or_default()),
            StreamEvent::Complete => {
                completed = true;
                break;
            }
            StreamEvent::Error { message, .. } => panic!("stream failed: {message}"),
        }
    }
    assert!(completed);
    assert_eq!(texts, vec!["Hel".to_string(), "lo".to_string()]);
}

#[tokio::test]
async fn retry_window_blocks_the_key_until_it_passes() {
    let too_many = error_response(
        429,
        "Too Many Requests",
        r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED",
            "details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"0.3s"}]}}"#,
    );
    let ok = json_response(
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]}}]}"#,
    );
    let addr = spawn_http_server(vec![too_many, ok]).await;
    let client = client_for(addr, ClientConfig::default());

    // First call: server 429 surfaces as RateLimited with the honored delay.
    let opts = RequestOptions {
        model: Some("flash-lite".to_string()),
        max_retries: Some(1),
        ..RequestOptions::default()
    };
    let err = client.generate("q", &opts).await.unwrap_err();
    let Error::RateLimited { retry_after, .. } = err else {
        panic!("expected RateLimited, got {err:?}");
    };
    assert!(retry_after >= Duration::from_millis(250) && retry_after <= Duration::from_millis(400));

    // Second call inside the window: blocked locally, no connection used.
    let non_blocking = RequestOptions {
        model: Some("flash-lite".to_string()),
        non_blocking: true,
        ..RequestOptions::default()
    };
    let err = client.generate("q", &non_blocking).await.unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));

    // After the window (plus jitter headroom) the key reopens and the
    // server's queued 200 is consumed.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let response = client.generate("q", &opts).await.unwrap();
    assert_eq!(response.text().as_deref(), Some("ok"));
}

#[tokio::test]
async fn over_budget_request_never_reaches_the_network() {
    // The server would panic the test if contacted: zero responses queued
    // means any connection is refused after the listener task exits.
    let addr = spawn_http_server(vec![]).await;
    let client = client_for(
        addr,
        ClientConfig::default().with_token_budget(1_000),
    );

    let opts = RequestOptions {
        model: Some("flash-lite".to_string()),
        estimated_input_tokens: Some(2_000),
        ..RequestOptions::default()
    };
    let err = client.generate("huge", &opts).await.unwrap_err();
    match err {
        Error::Budget {
            reason,
            retry_after,
        } => {
            assert_eq!(reason, gemini_client::BudgetBlockedReason::OverBudget);
            assert_eq!(retry_after, None);
        }
        other => panic!("expected OverBudget, got {other:?}"),
    }
}

#[tokio::test]
async fn server_5xx_is_retried_until_success() {
    let addr = spawn_http_server(vec![
        error_response(503, "Service Unavailable", r#"{"error":{"message":"try later"}}"#),
        json_response(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]}}]}"#),
    ])
    .await;
    let mut config = ClientConfig::default();
    config.base_backoff = Duration::from_millis(20);
    let client = client_for(addr, config);

    let response = client
        .generate("q", &RequestOptions::new().with_model("flash-lite"))
        .await
        .unwrap();
    assert_eq!(response.text().as_deref(), Some("ok"));
}

#[tokio::test]
async fn client_4xx_is_not_retried() {
    let addr = spawn_http_server(vec![error_response(
        400,
        "Bad Request",
        r#"{"error":{"code":400,"message":"Invalid argument"}}"#,
    )])
    .await;
    let client = client_for(addr, ClientConfig::default());

    let err = client
        .generate("q", &RequestOptions::new().with_model("flash-lite"))
        .await
        .unwrap_err();
    match err {
        Error::Http { status, message, .. } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Invalid argument");
        }
        other => panic!("expected Http, got {other:?}"),
    }
}

#[tokio::test]
async fn count_tokens_round_trip() {
    let addr = spawn_http_server(vec![json_response(r#"{"totalTokens": 7}"#)]).await;
    let client = client_for(addr, ClientConfig::default());

    let counted = client
        .count_tokens("hello there", &RequestOptions::new().with_model("flash-lite"))
        .await
        .unwrap();
    assert_eq!(counted.total_tokens, 7);
}

#[tokio::test]
async fn list_models_parses_catalog() {
    let addr = spawn_http_server(vec![json_response(
        r#"{"models": [
            {"name": "models/gemini-2.0-flash", "displayName": "Gemini 2.0 Flash",
             "inputTokenLimit": 1048576, "outputTokenLimit": 8192,
             "supportedGenerationMethods": ["generateContent", "countTokens"]}
        ]}"#,
    )])
    .await;
    let client = client_for(addr, ClientConfig::default());

    let listing = client.list_models(&RequestOptions::default()).await.unwrap();
    assert_eq!(listing.models.len(), 1);
    assert_eq!(listing.models[0].name, "models/gemini-2.0-flash");
    assert_eq!(listing.models[0].input_token_limit, Some(1_048_576));
}

#[tokio::test]
async fn operation_polling_until_done() {
    let addr = spawn_http_server(vec![
        json_response(r#"{"name": "operations/op-1", "done": false, "metadata": {"progressPercent": 40}}"#),
        json_response(r#"{"name": "operations/op-1", "done": true, "response": {"result": "done"}}"#),
    ])
    .await;
    let client = client_for(addr, ClientConfig::default());

    let config = gemini_client::PollConfig {
        initial_interval: Duration::from_millis(10),
        ..gemini_client::PollConfig::default()
    };
    let operation = client
        .wait_for_operation(
            "operations/op-1",
            config,
            None,
            &gemini_client::PollToken::new(),
            &RequestOptions::default(),
        )
        .await
        .unwrap();
    assert!(operation.done);
    assert_eq!(operation.into_result().unwrap()["result"], "done");
}
