//! Process-wide rate limiter.
//!
//! One actor task owns all limiter state (permit pools, token budgets,
//! retry windows) and processes commands from a channel, so every public
//! operation is atomic with respect to the rest. Callers hold a cheap
//! [`RateLimiter`] handle.
//!
//! State is partitioned by **concurrency key** (defaults to the model id):
//!
//! - a permit pool bounding in-flight requests per key,
//! - a single sliding token-budget window with pre-flight reservation and
//!   post-hoc reconciliation,
//! - a retry window populated from server 429s that blocks the whole key
//!   until it passes,
//! - optionally, adaptive permit counts (+1 per committed success up to a
//!   ceiling, ×0.75 per 429 down to 1).
//!
//! Waiters within one key are strictly FIFO. A [`Reservation`] releases its
//! permits and reserved tokens on drop if never committed, so a caller that
//! dies cannot leak capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::BudgetBlockedReason;
use crate::{Error, Result};

/// Fraction of the server-requested wait added as jitter when a retry
/// window is set, so released waiters do not all fire at once.
const RETRY_WINDOW_JITTER: f64 = 0.1;

/// Per-key settings applied when a key is first seen.
#[derive(Debug, Clone)]
pub struct KeySettings {
    /// Permit pool size.
    pub max_permits: u32,
    /// Budget window length.
    pub window_duration: Duration,
    /// Token budget per window; `None` disables budget tracking for the key.
    pub budget_total: Option<u32>,
    /// Single-request ceiling as a multiple of `budget_total`.
    pub safety_multiplier: f64,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            max_permits: 4,
            window_duration: Duration::from_millis(60_000),
            budget_total: None,
            safety_multiplier: 1.0,
        }
    }
}

/// Global limiter behavior.
#[derive(Debug, Clone, Default)]
pub struct LimiterSettings {
    /// Defaults for keys that arrive without explicit settings.
    pub key_defaults: KeySettings,
    /// Whether permit pools adapt to observed successes/429s.
    pub adaptive: bool,
    /// Ceiling for adaptive growth.
    pub adaptive_ceiling: u32,
}

/// A reservation request.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Concurrency key (model id unless overridden).
    pub key: String,
    /// Permits to hold for the duration of the request.
    pub permits: u32,
    /// Estimated tokens to reserve against the window budget.
    pub tokens: u32,
    /// How long a blocking reserve may wait. `None` = forever.
    pub deadline: Option<Duration>,
    /// When set, any shortfall returns immediately instead of queueing.
    pub non_blocking: bool,
    /// Settings applied if this key has not been seen before.
    pub settings: Option<KeySettings>,
}

impl ReserveRequest {
    /// A single-permit reservation for `key` with the given token estimate.
    pub fn new(key: impl Into<String>, tokens: u32) -> Self {
        Self {
            key: key.into(),
            permits: 1,
            tokens,
            deadline: None,
            non_blocking: false,
            settings: None,
        }
    }

    /// Sets the blocking deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Makes the reserve non-blocking.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// Supplies key settings for first touch.
    pub fn with_settings(mut self, settings: KeySettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// Observable key state, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySnapshot {
    pub in_use: u32,
    pub max_permits: u32,
    pub used_tokens: u32,
    pub reserved_tokens: u32,
    pub queued_waiters: usize,
    pub retry_window_active: bool,
}

struct Grant {
    reservation_id: u64,
    tokens_reserved: u32,
    permits: u32,
}

enum Command {
    Reserve {
        request: ReserveRequest,
        reply: oneshot::Sender<Result<Grant>>,
    },
    Commit {
        key: String,
        reservation_id: u64,
        actual_tokens: u32,
    },
    Release {
        key: String,
        reservation_id: u64,
    },
    RecordError {
        key: String,
        retry_after: Duration,
    },
    CheckRetryWindow {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ExpireWaiter {
        key: String,
        waiter_id: u64,
    },
    WindowTick {
        key: String,
    },
    RetryTick {
        key: String,
    },
    Snapshot {
        key: String,
        reply: oneshot::Sender<Option<KeySnapshot>>,
    },
}

struct Waiter {
    id: u64,
    permits: u32,
    tokens: u32,
    reply: oneshot::Sender<Result<Grant>>,
}

struct ReservationState {
    permits: u32,
    tokens_reserved: u32,
}

struct KeyState {
    settings: KeySettings,
    max_permits: u32,
    in_use: u32,
    used_tokens: u32,
    reserved_tokens: u32,
    window_start: Instant,
    retry_until: Option<Instant>,
    waiters: VecDeque<Waiter>,
    reservations: HashMap<u64, ReservationState>,
    window_tick_scheduled: bool,
    retry_tick_scheduled: bool,
}

impl KeyState {
    fn new(settings: KeySettings) -> Self {
        Self {
            max_permits: settings.max_permits,
            settings,
            in_use: 0,
            used_tokens: 0,
            reserved_tokens: 0,
            window_start: Instant::now(),
            retry_until: None,
            waiters: VecDeque::new(),
            reservations: HashMap::new(),
            window_tick_scheduled: false,
            retry_tick_scheduled: false,
        }
    }

    /// Slides the budget window when it has elapsed. `used` resets to zero;
    /// tokens held by still-outstanding reservations stay charged, against
    /// the new window.
    fn maybe_slide_window(&mut self, now: Instant) {
        if now >= self.window_start + self.settings.window_duration {
            self.window_start = now;
            self.used_tokens = 0;
        }
    }

    fn window_remaining(&self, now: Instant) -> Duration {
        (self.window_start + self.settings.window_duration).saturating_duration_since(now)
    }

    fn retry_window_remaining(&self, now: Instant) -> Option<Duration> {
        let until = self.retry_until?;
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }

    fn budget_has_room(&self, tokens: u32) -> bool {
        match self.settings.budget_total {
            None => true,
            Some(total) => {
                self.used_tokens as u64 + self.reserved_tokens as u64 + tokens as u64
                    <= total as u64
            }
        }
    }

    fn request_too_large(&self, tokens: u32) -> bool {
        match self.settings.budget_total {
            None => false,
            Some(total) => tokens as f64 > total as f64 * self.settings.safety_multiplier,
        }
    }

    fn permits_available(&self, permits: u32) -> bool {
        self.in_use + permits <= self.max_permits
    }
}

struct Actor {
    settings: LimiterSettings,
    keys: HashMap<String, KeyState>,
    next_id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl Actor {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                self.handle(command);
            }
        });
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Reserve { request, reply } => self.handle_reserve(request, reply),
            Command::Commit {
                key,
                reservation_id,
                actual_tokens,
            } => self.handle_commit(&key, reservation_id, actual_tokens),
            Command::Release {
                key,
                reservation_id,
            } => self.handle_release(&key, reservation_id),
            Command::RecordError { key, retry_after } => {
                self.handle_record_error(&key, retry_after)
            }
            Command::CheckRetryWindow { key, reply } => {
                let result = self.check_retry_window(&key);
                let _ = reply.send(result);
            }
            Command::ExpireWaiter { key, waiter_id } => self.expire_waiter(&key, waiter_id),
            Command::WindowTick { key } => {
                if let Some(state) = self.keys.get_mut(&key) {
                    state.window_tick_scheduled = false;
                }
                self.wake_waiters(&key);
            }
            Command::RetryTick { key } => {
                if let Some(state) = self.keys.get_mut(&key) {
                    state.retry_tick_scheduled = false;
                }
                self.wake_waiters(&key);
            }
            Command::Snapshot { key, reply } => {
                let now = Instant::now();
                let snapshot = self.keys.get(&key).map(|state| KeySnapshot {
                    in_use: state.in_use,
                    max_permits: state.max_permits,
                    used_tokens: state.used_tokens,
                    reserved_tokens: state.reserved_tokens,
                    queued_waiters: state.waiters.len(),
                    retry_window_active: state.retry_window_remaining(now).is_some(),
                });
                let _ = reply.send(snapshot);
            }
        }
    }

    fn key_state(&mut self, key: &str, settings: Option<KeySettings>) -> &mut KeyState {
        if !self.keys.contains_key(key) {
            let settings = settings.unwrap_or_else(|| self.settings.key_defaults.clone());
            self.keys.insert(key.to_string(), KeyState::new(settings));
        }
        self.keys.get_mut(key).expect("key state just inserted")
    }

    fn check_retry_window(&mut self, key: &str) -> Result<()> {
        let now = Instant::now();
        match self
            .keys
            .get(key)
            .and_then(|state| state.retry_window_remaining(now))
        {
            Some(remaining) => Err(Error::rate_limited(remaining)),
            None => Ok(()),
        }
    }

    fn handle_reserve(&mut self, request: ReserveRequest, reply: oneshot::Sender<Result<Grant>>) {
        let now = Instant::now();
        let key = request.key.clone();
        let state = self.key_state(&key, request.settings.clone());
        state.maybe_slide_window(now);

        // A request larger than the whole window can never succeed; it fails
        // even in blocking mode.
        if state.request_too_large(request.tokens) {
            let _ = reply.send(Err(Error::budget(BudgetBlockedReason::OverBudget, None)));
            return;
        }

        // Retry window gates everything else for the key.
        if let Some(remaining) = state.retry_window_remaining(now) {
            if request.non_blocking {
                let _ = reply.send(Err(Error::rate_limited(remaining)));
            } else {
                self.enqueue_waiter(key, request, reply);
            }
            return;
        }

        // FIFO: while older waiters queue, new arrivals go behind them.
        if !state.waiters.is_empty() {
            if request.non_blocking {
                let _ = reply.send(Err(Error::budget(
                    BudgetBlockedReason::NoPermit,
                    None,
                )));
            } else {
                self.enqueue_waiter(key, request, reply);
            }
            return;
        }

        if !state.budget_has_room(request.tokens) {
            if request.non_blocking {
                let retry_after = state.window_remaining(now);
                let _ = reply.send(Err(Error::budget(
                    BudgetBlockedReason::BudgetFull,
                    Some(retry_after),
                )));
            } else {
                self.schedule_window_tick(&key);
                self.enqueue_waiter(key, request, reply);
            }
            return;
        }

        if !state.permits_available(request.permits) {
            if request.permits > state.max_permits {
                // Can never be satisfied by waiting.
                let _ = reply.send(Err(Error::budget(BudgetBlockedReason::NoPermit, None)));
                return;
            }
            if request.non_blocking {
                let _ = reply.send(Err(Error::budget(BudgetBlockedReason::NoPermit, None)));
            } else {
                self.enqueue_waiter(key, request, reply);
            }
            return;
        }

        let grant = self.grant(&key, request.permits, request.tokens);
        let _ = reply.send(Ok(grant));
    }

    fn grant(&mut self, key: &str, permits: u32, tokens: u32) -> Grant {
        let id = self.next_id;
        self.next_id += 1;
        let state = self.keys.get_mut(key).expect("granting for a known key");
        state.in_use += permits;
        state.reserved_tokens += tokens;
        state.reservations.insert(
            id,
            ReservationState {
                permits,
                tokens_reserved: tokens,
            },
        );
        Grant {
            reservation_id: id,
            tokens_reserved: tokens,
            permits,
        }
    }

    fn enqueue_waiter(
        &mut self,
        key: String,
        request: ReserveRequest,
        reply: oneshot::Sender<Result<Grant>>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let state = self.keys.get_mut(&key).expect("enqueueing for a known key");
        state.waiters.push_back(Waiter {
            id,
            permits: request.permits,
            tokens: request.tokens,
            reply,
        });
        if let Some(deadline) = request.deadline {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(Command::ExpireWaiter {
                    key,
                    waiter_id: id,
                });
            });
        }
    }

    fn expire_waiter(&mut self, key: &str, waiter_id: u64) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            let waiter = state.waiters.remove(pos).expect("position just found");
            let _ = waiter.reply.send(Err(Error::budget(
                BudgetBlockedReason::PermitTimeout,
                None,
            )));
        }
    }

    fn handle_commit(&mut self, key: &str, reservation_id: u64, actual_tokens: u32) {
        let adaptive = self.settings.adaptive;
        let ceiling = self.settings.adaptive_ceiling;
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        let Some(reservation) = state.reservations.remove(&reservation_id) else {
            return;
        };
        state.in_use = state.in_use.saturating_sub(reservation.permits);
        state.reserved_tokens = state
            .reserved_tokens
            .saturating_sub(reservation.tokens_reserved);
        state.used_tokens = state.used_tokens.saturating_add(actual_tokens);
        if adaptive && state.max_permits < ceiling {
            state.max_permits += 1;
        }
        self.wake_waiters(key);
    }

    fn handle_release(&mut self, key: &str, reservation_id: u64) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        let Some(reservation) = state.reservations.remove(&reservation_id) else {
            return;
        };
        state.in_use = state.in_use.saturating_sub(reservation.permits);
        state.reserved_tokens = state
            .reserved_tokens
            .saturating_sub(reservation.tokens_reserved);
        self.wake_waiters(key);
    }

    fn handle_record_error(&mut self, key: &str, retry_after: Duration) {
        let adaptive = self.settings.adaptive;
        let state = self.key_state(key, None);
        // Jitter the stored deadline so queued waiters spread out on release.
        let jitter_ms = (retry_after.as_millis() as f64 * RETRY_WINDOW_JITTER
            * rand::random::<f64>()) as u64;
        let until = Instant::now() + retry_after + Duration::from_millis(jitter_ms);
        state.retry_until = Some(until);
        if adaptive {
            let reduced = ((state.max_permits as f64) * 0.75).floor() as u32;
            state.max_permits = reduced.max(1);
        }
        warn!(
            key,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limited; retry window set"
        );
        self.schedule_retry_tick(key);
    }

    fn schedule_window_tick(&mut self, key: &str) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        if state.window_tick_scheduled {
            return;
        }
        state.window_tick_scheduled = true;
        let remaining = state.window_remaining(Instant::now());
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(remaining + Duration::from_millis(1)).await;
            let _ = tx.send(Command::WindowTick { key });
        });
    }

    fn schedule_retry_tick(&mut self, key: &str) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        if state.retry_tick_scheduled {
            return;
        }
        let Some(until) = state.retry_until else {
            return;
        };
        state.retry_tick_scheduled = true;
        let remaining = until.saturating_duration_since(Instant::now());
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(remaining + Duration::from_millis(1)).await;
            let _ = tx.send(Command::RetryTick { key });
        });
    }

    /// Grants to as many queued waiters as capacity allows, strictly in FIFO
    /// order: the head waiter blocks everyone behind it.
    fn wake_waiters(&mut self, key: &str) {
        let now = Instant::now();
        loop {
            let Some(state) = self.keys.get_mut(key) else {
                return;
            };
            state.maybe_slide_window(now);

            if state.waiters.is_empty() {
                return;
            }
            if state.retry_window_remaining(now).is_some() {
                self.schedule_retry_tick(key);
                return;
            }

            let head = state.waiters.front().expect("non-empty queue");
            if !state.budget_has_room(head.tokens) {
                self.schedule_window_tick(key);
                return;
            }
            if !state.permits_available(head.permits) {
                return;
            }

            let waiter = state.waiters.pop_front().expect("non-empty queue");
            let grant = self.grant(key, waiter.permits, waiter.tokens);
            if let Err(returned) = waiter.reply.send(Ok(grant)) {
                // Waiter is gone; reclaim its grant immediately.
                debug!(key, "waiter dropped before grant; reclaiming");
                if let Ok(grant) = returned {
                    self.handle_release(key, grant.reservation_id);
                }
            }
        }
    }
}

/// Handle to the limiter actor. Clones share the same state.
#[derive(Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Command>,
}

impl RateLimiter {
    /// Spawns a limiter actor with the given settings.
    pub fn new(settings: LimiterSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            settings,
            keys: HashMap::new(),
            next_id: 1,
            tx: tx.clone(),
        };
        actor.run(rx);
        Self { tx }
    }

    /// The process-wide limiter instance, created on first use.
    pub fn global() -> &'static RateLimiter {
        static GLOBAL: OnceLock<RateLimiter> = OnceLock::new();
        GLOBAL.get_or_init(|| RateLimiter::new(LimiterSettings::default()))
    }

    /// Fast-path check of the key's retry window.
    ///
    /// Returns [`Error::RateLimited`] with the remaining wait while a 429
    /// window is active.
    pub async fn check_retry_window(&self, key: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CheckRetryWindow {
                key: key.to_string(),
                reply,
            })
            .map_err(|_| limiter_gone())?;
        rx.await.map_err(|_| limiter_gone())?
    }

    /// Atomically reserves permits and budget tokens for a request.
    ///
    /// Blocking requests queue FIFO behind earlier waiters on the same key;
    /// non-blocking requests never sleep. The returned [`Reservation`] must
    /// be committed with the actual token usage, and releases everything on
    /// drop otherwise.
    pub async fn try_reserve(&self, request: ReserveRequest) -> Result<Reservation> {
        let key = request.key.clone();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reserve { request, reply })
            .map_err(|_| limiter_gone())?;
        let grant = rx.await.map_err(|_| limiter_gone())??;
        Ok(Reservation {
            key,
            reservation_id: grant.reservation_id,
            tokens_reserved: grant.tokens_reserved,
            permits: grant.permits,
            tx: Some(self.tx.clone()),
        })
    }

    /// Records a server 429 for the key, opening its retry window and
    /// shrinking the permit pool in adaptive mode.
    pub fn record_error(&self, key: &str, retry_after: Duration) {
        let _ = self.tx.send(Command::RecordError {
            key: key.to_string(),
            retry_after,
        });
    }

    /// Snapshot of a key's counters, for diagnostics and tests.
    pub async fn snapshot(&self, key: &str) -> Option<KeySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot {
                key: key.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

fn limiter_gone() -> Error {
    Error::validation("rate limiter task is gone")
}

/// A granted reservation: permits held plus tokens charged to the window.
///
/// Commit with the actual usage from response metadata; dropping without a
/// commit releases both the permits and the reserved tokens.
#[derive(Debug)]
pub struct Reservation {
    key: String,
    reservation_id: u64,
    tokens_reserved: u32,
    permits: u32,
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Reservation {
    /// Tokens reserved at grant time.
    pub fn tokens_reserved(&self) -> u32 {
        self.tokens_reserved
    }

    /// Permits held by this reservation.
    pub fn permits(&self) -> u32 {
        self.permits
    }

    /// Concurrency key the reservation belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the permits and charges `actual_tokens` to the window,
    /// returning the unused remainder of the reservation.
    pub fn commit(mut self, actual_tokens: u32) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Command::Commit {
                key: self.key.clone(),
                reservation_id: self.reservation_id,
                actual_tokens,
            });
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Command::Release {
                key: self.key.clone(),
                reservation_id: self.reservation_id,
            });
        }
    }
}
