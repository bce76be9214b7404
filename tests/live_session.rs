//! Live session flows against an in-process fake WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use gemini_client::{
    AuthStrategy, Client, Credentials, Error, LimiterSettings, LiveCallbacks, LiveConfig,
    LiveErrorKind, RateLimiter, RequestOptions, SessionState,
};

/// A scripted Live server: accepts one connection, waits for the setup
/// frame, then replays `frames` with `pause` between them and keeps the
/// socket open until the client closes.
async fn spawn_live_server(frames: Vec<String>, pause: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        // First client frame must be the setup.
        let Some(Ok(Message::Text(setup))) = ws.next().await else {
            return;
        };
        assert!(setup.contains("\"setup\""), "first frame was not a setup: {setup}");

        for frame in frames {
            if ws.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
            tokio::time::sleep(pause).await;
        }
        // Hold the connection until the peer closes or errors.
        while let Some(message) = ws.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    });
    addr
}

fn live_client(addr: SocketAddr) -> Client {
    Client::builder()
        .credentials(AuthStrategy::Gemini, Credentials::api_key("test-key"))
        .endpoint(format!("http://{addr}"))
        .limiter(RateLimiter::new(LimiterSettings::default()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn setup_then_go_away_keeps_session_ready() {
    let addr = spawn_live_server(
        vec![
            r#"{"setupComplete": {}}"#.to_string(),
            r#"{"goAway": {"timeLeft": "500ms"}}"#.to_string(),
            r#"{"sessionResumptionUpdate": {"newHandle": "h-42", "resumable": true}}"#.to_string(),
        ],
        Duration::from_millis(50),
    )
    .await;
    let client = live_client(addr);

    let go_away_count = Arc::new(AtomicUsize::new(0));
    let counter = go_away_count.clone();
    let callbacks = LiveCallbacks::new().on_go_away(move |time_left| {
        assert_eq!(time_left, Some(Duration::from_millis(500)));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let session = client
        .live_session(
            LiveConfig::new("gemini-2.0-flash-live-001"),
            callbacks,
            &RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    // Give the scripted frames time to arrive.
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(go_away_count.load(Ordering::SeqCst), 1);
    // GoAway does not leave Ready; it only records the deadline hint.
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.deadline_hint().is_some());
    assert_eq!(session.resumption_handle().as_deref(), Some("h-42"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn tool_call_callback_response_is_sent_back() {
    let addr = spawn_live_server(
        vec![
            r#"{"setupComplete": {}}"#.to_string(),
            r#"{"toolCall": {"functionCalls": [{"id": "c1", "name": "get_time", "args": {}}]}}"#
                .to_string(),
        ],
        Duration::from_millis(30),
    )
    .await;
    let client = live_client(addr);

    let callbacks = LiveCallbacks::new().on_tool_call(|calls| {
        Some(
            calls
                .iter()
                .map(|call| gemini_client::FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: serde_json::json!({"now": "T"}),
                })
                .collect(),
        )
    });

    let session = client
        .live_session(
            LiveConfig::new("gemini-2.0-flash-live-001"),
            callbacks,
            &RequestOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The callback answered immediately, so nothing is left pending.
    assert!(session.pending_tool_calls().is_empty());
    session.close().await.unwrap();
}

#[tokio::test]
async fn first_frame_other_than_setup_complete_fails_the_session() {
    let addr = spawn_live_server(
        vec![r#"{"serverContent": {"turnComplete": true}}"#.to_string()],
        Duration::from_millis(10),
    )
    .await;
    let client = live_client(addr);

    let err = client
        .live_session(
            LiveConfig::new("gemini-2.0-flash-live-001"),
            LiveCallbacks::new(),
            &RequestOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Live {
            kind: LiveErrorKind::SetupFailed
        }
    ));
}

#[tokio::test]
async fn client_content_reaches_the_server() {
    // The server echoes nothing; this test only exercises the send path
    // and clean close while Ready.
    let addr = spawn_live_server(
        vec![r#"{"setupComplete": {}}"#.to_string()],
        Duration::from_millis(5),
    )
    .await;
    let client = live_client(addr);

    let session = client
        .live_session(
            LiveConfig::new("gemini-2.0-flash-live-001"),
            LiveCallbacks::new(),
            &RequestOptions::default(),
        )
        .await
        .unwrap();

    session
        .send_client_content(vec![gemini_client::Content::user_text("hello")], true)
        .await
        .unwrap();
    session
        .send_realtime_input(gemini_client::RealtimeInput::Text("chunk".to_string()))
        .await
        .unwrap();
    session.close().await.unwrap();
}
