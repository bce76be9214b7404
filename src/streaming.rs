//! SSE stream lifecycle management.
//!
//! A [`StreamManager`] actor owns every named stream: starting a stream
//! spawns a worker that holds one rate-limiter permit for the stream's
//! whole lifetime, opens the SSE request, and feeds decoded chunks back to
//! the manager, which fans them out to subscribers.
//!
//! Ordering: chunks reach each subscriber in upstream receipt order. A
//! subscriber that joins late first receives the buffered history, so its
//! view is still the upstream order. Cross-subscriber interleaving is
//! unspecified.
//!
//! Retry: connection-level failures before the first delivered chunk are
//! retried with exponential backoff and jitter; a 429 opens the limiter's
//! retry window and sleeps it out. Once any chunk has been delivered the
//! stream never retries.
//!
//! Finished streams stay queryable for a grace period so subscribers can
//! collect terminal status, then evict.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StreamErrorKind;
use crate::http::{Headers, HttpTransport};
use crate::limiter::{KeySettings, RateLimiter, ReserveRequest};
use crate::retry::{apply_jitter, classify_http_error};
use crate::types::{GenerateContentResponse, UsageMetadata};
use crate::{Error, Result};

/// Opaque stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(Uuid);

impl StreamId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Worker spawned, no chunk yet.
    Starting,
    /// At least one chunk delivered.
    Active,
    /// Upstream closed cleanly.
    Completed,
    /// Terminal failure.
    Error,
    /// Stopped by the caller.
    Stopped,
}

impl StreamStatus {
    /// Whether the stream can still produce chunks.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Starting | StreamStatus::Active)
    }
}

/// Event fanned out to stream subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One decoded response chunk, in receipt order.
    Chunk(GenerateContentResponse),
    /// Upstream finished cleanly.
    Complete,
    /// Terminal failure.
    Error {
        /// Failure classification.
        kind: StreamErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl StreamEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// Everything a worker needs to run one stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Fully-built SSE URL (`...:streamGenerateContent?alt=sse...`).
    pub url: String,
    /// Headers including resolved auth.
    pub headers: Headers,
    /// JSON request body.
    pub body: serde_json::Value,
    /// Per-attempt timeout for the underlying request.
    pub timeout: Duration,
    /// Limiter concurrency key.
    pub key: String,
    /// Estimated input tokens to reserve.
    pub estimated_tokens: u32,
    /// Limiter key settings for first touch.
    pub key_settings: Option<KeySettings>,
    /// Reconnect attempts before the first chunk.
    pub max_retries: u32,
    /// First reconnect delay.
    pub base_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// How long finished streams stay queryable.
    pub cleanup_delay: Duration,
    /// Default subscriber gap timeout.
    pub receive_timeout: Duration,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_millis(30_000),
            receive_timeout: Duration::from_millis(30_000),
        }
    }
}

type SubscriberId = u64;

enum Command {
    Start {
        request: StreamRequest,
        reply: oneshot::Sender<StreamId>,
    },
    Subscribe {
        id: StreamId,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        id: StreamId,
        subscriber: SubscriberId,
    },
    Stop {
        id: StreamId,
    },
    Status {
        id: StreamId,
        reply: oneshot::Sender<Option<StreamStatus>>,
    },
    Event {
        id: StreamId,
        event: StreamEvent,
    },
    Evict {
        id: StreamId,
    },
}

struct StreamState {
    status: StreamStatus,
    buffer: Vec<StreamEvent>,
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<StreamEvent>)>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

struct ManagerActor {
    config: StreamManagerConfig,
    transport: HttpTransport,
    limiter: RateLimiter,
    streams: HashMap<StreamId, StreamState>,
    next_subscriber: SubscriberId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ManagerActor {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                self.handle(command);
            }
        });
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let id = StreamId::new();
                let worker = spawn_worker(
                    id,
                    request,
                    self.transport.clone(),
                    self.limiter.clone(),
                    self.tx.clone(),
                );
                self.streams.insert(
                    id,
                    StreamState {
                        status: StreamStatus::Starting,
                        buffer: Vec::new(),
                        subscribers: Vec::new(),
                        worker: Some(worker),
                    },
                );
                let _ = reply.send(id);
            }
            Command::Subscribe { id, reply } => {
                let receive_timeout = self.config.receive_timeout;
                let subscriber_id = self.next_subscriber;
                self.next_subscriber += 1;
                let result = match self.streams.get_mut(&id) {
                    None => Err(Error::validation(format!("unknown stream {id}"))),
                    Some(state) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        // Replay history so the subscriber's view is the
                        // upstream order from the beginning.
                        for event in &state.buffer {
                            let _ = tx.send(event.clone());
                        }
                        if !state.status.is_terminal() {
                            state.subscribers.push((subscriber_id, tx));
                        }
                        Ok(Subscription {
                            stream_id: id,
                            subscriber_id,
                            rx,
                            receive_timeout,
                            done: false,
                        })
                    }
                };
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id, subscriber } => {
                if let Some(state) = self.streams.get_mut(&id) {
                    state.subscribers.retain(|(sid, _)| *sid != subscriber);
                }
            }
            Command::Stop { id } => {
                if let Some(state) = self.streams.get_mut(&id) {
                    if let Some(worker) = state.worker.take() {
                        // Aborting the worker drops its reservation, which
                        // returns the permit.
                        worker.abort();
                    }
                    if !state.status.is_terminal() {
                        state.status = StreamStatus::Stopped;
                    }
                    state.subscribers.clear();
                    self.schedule_evict(id);
                }
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.streams.get(&id).map(|s| s.status));
            }
            Command::Event { id, event } => {
                let Some(state) = self.streams.get_mut(&id) else {
                    return;
                };
                if matches!(state.status, StreamStatus::Stopped) {
                    return;
                }
                match &event {
                    StreamEvent::Chunk(_) => state.status = StreamStatus::Active,
                    StreamEvent::Complete => state.status = StreamStatus::Completed,
                    StreamEvent::Error { .. } => state.status = StreamStatus::Error,
                }
                state.buffer.push(event.clone());
                state
                    .subscribers
                    .retain(|(_, tx)| tx.send(event.clone()).is_ok());
                if event.is_terminal() {
                    state.subscribers.clear();
                    state.worker = None;
                    self.schedule_evict(id);
                }
            }
            Command::Evict { id } => {
                self.streams.remove(&id);
            }
        }
    }

    fn schedule_evict(&self, id: StreamId) {
        let tx = self.tx.clone();
        let delay = self.config.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::Evict { id });
        });
    }
}

/// Handle to the stream manager actor. Clones share state.
#[derive(Clone)]
pub struct StreamManager {
    tx: mpsc::UnboundedSender<Command>,
}

impl StreamManager {
    /// Spawns a manager over the given transport and limiter.
    pub fn new(
        config: StreamManagerConfig,
        transport: HttpTransport,
        limiter: RateLimiter,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            config,
            transport,
            limiter,
            streams: HashMap::new(),
            next_subscriber: 1,
            tx: tx.clone(),
        };
        actor.run(rx);
        Self { tx }
    }

    /// Starts a stream; the worker acquires its permit asynchronously.
    pub async fn start(&self, request: StreamRequest) -> Result<StreamId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start { request, reply })
            .map_err(|_| manager_gone())?;
        rx.await.map_err(|_| manager_gone())
    }

    /// Subscribes to a stream, replaying buffered events first.
    pub async fn subscribe(&self, id: StreamId) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { id, reply })
            .map_err(|_| manager_gone())?;
        rx.await.map_err(|_| manager_gone())?
    }

    /// Removes a subscriber from a stream.
    pub fn unsubscribe(&self, id: StreamId, subscriber: SubscriberId) {
        let _ = self.tx.send(Command::Unsubscribe { id, subscriber });
    }

    /// Cancels the stream's request and releases its permit.
    pub fn stop(&self, id: StreamId) {
        let _ = self.tx.send(Command::Stop { id });
    }

    /// Current lifecycle state, or `None` once evicted.
    pub async fn status(&self, id: StreamId) -> Option<StreamStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status { id, reply }).ok()?;
        rx.await.ok().flatten()
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager").finish_non_exhaustive()
    }
}

fn manager_gone() -> Error {
    Error::validation("stream manager task is gone")
}

/// A subscriber's view of one stream.
///
/// [`Subscription::next`] yields events in upstream order. When no chunk
/// arrives within the receive timeout, it yields a timeout error for this
/// subscriber without affecting the stream itself.
#[derive(Debug)]
pub struct Subscription {
    stream_id: StreamId,
    subscriber_id: SubscriberId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    receive_timeout: Duration,
    done: bool,
}

impl Subscription {
    /// The stream this subscription belongs to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// This subscriber's id, for [`StreamManager::unsubscribe`].
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Overrides the receive timeout for this subscriber.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Next event, or `None` after a terminal event has been yielded.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        match tokio::time::timeout(self.receive_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                Some(StreamEvent::Error {
                    kind: StreamErrorKind::Timeout,
                    message: format!(
                        "no chunk within {:?} for this subscriber",
                        self.receive_timeout
                    ),
                })
            }
        }
    }

    /// Collects the remaining chunks, erroring on a terminal failure.
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

fn spawn_worker(
    id: StreamId,
    request: StreamRequest,
    transport: HttpTransport,
    limiter: RateLimiter,
    tx: mpsc::UnboundedSender<Command>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let event = |event: StreamEvent| {
            let _ = tx.send(Command::Event { id, event });
        };

        // The permit is held for the whole stream lifetime; dropping the
        // reservation (including via worker abort) releases it.
        let mut reserve = ReserveRequest::new(request.key.clone(), request.estimated_tokens);
        reserve.settings = request.key_settings.clone();
        let reservation = match limiter.try_reserve(reserve).await {
            Ok(reservation) => reservation,
            Err(err) => {
                event(StreamEvent::Error {
                    kind: StreamErrorKind::Connect,
                    message: err.to_string(),
                });
                return;
            }
        };

        let mut attempt: u32 = 1;
        let mut usage: Option<UsageMetadata> = None;
        loop {
            let mut delivered = 0u32;
            let result = transport
                .do_sse(
                    &request.url,
                    &request.headers,
                    &request.body,
                    request.timeout,
                    |chunk| {
                        match serde_json::from_value::<GenerateContentResponse>(chunk) {
                            Ok(response) => {
                                delivered += 1;
                                if let Some(meta) = &response.usage_metadata {
                                    usage = Some(meta.clone());
                                }
                                event(StreamEvent::Chunk(response));
                            }
                            Err(err) => {
                                warn!(stream = %id, error = %err, "undecodable chunk dropped");
                            }
                        }
                    },
                )
                .await;

            match result {
                Ok(()) => {
                    let actual = usage.as_ref().map(|u| u.billed_tokens()).unwrap_or(0);
                    reservation.commit(actual);
                    event(StreamEvent::Complete);
                    return;
                }
                Err(err) => {
                    let err = classify_http_error(err);
                    // Once anything has shipped, a retry would replay
                    // delivered chunks; the failure is terminal.
                    if delivered > 0 {
                        event(StreamEvent::Error {
                            kind: StreamErrorKind::UpstreamClosed,
                            message: err.to_string(),
                        });
                        return;
                    }
                    if let Error::RateLimited { retry_after, .. } = &err {
                        limiter.record_error(&request.key, *retry_after);
                    }
                    if attempt >= request.max_retries || !err.is_retryable() {
                        event(StreamEvent::Error {
                            kind: StreamErrorKind::Connect,
                            message: err.to_string(),
                        });
                        return;
                    }
                    let delay = match &err {
                        Error::RateLimited { retry_after, .. } => *retry_after,
                        _ => backoff_delay(
                            request.base_backoff,
                            request.max_backoff,
                            attempt,
                        ),
                    };
                    debug!(stream = %id, attempt, ?delay, "reconnecting stream");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    })
}

/// `base * 2^(attempt-1)` ±25 % jitter, capped.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(cap.as_millis() as f64);
    Duration::from_millis(apply_jitter(capped, 0.25))
}
