/// Live push feeds: one WebSocket per feed, with an optional reconnect policy.
///
/// A feed task forwards JSON text frames and its connection state to the
/// runtime queue. Dropping the [`FeedHandle`] closes the socket.
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Which feed an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Rooms,
    Thread,
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKind::Rooms => write!(f, "rooms"),
            FeedKind::Thread => write!(f, "thread"),
        }
    }
}

/// Connection state of a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedState {
    /// Dialing; `attempt` counts consecutive failures so far
    Connecting { attempt: u32 },
    Open,
    Closed,
    Failed { reason: String },
}

/// Output of a feed task
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    State(FeedState),
    Frame(String),
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failures
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Connect once, never retry
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let spread = (self.initial_delay.as_millis() / 2) as u64;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    fn gives_up_after(&self, failures: u32) -> bool {
        !self.enabled || self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Owner of a running feed task
pub struct FeedHandle {
    kind: FeedKind,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Close the socket and wait for the task to finish
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn a feed task for `url`. Each event is mapped through `wrap` before it
/// is queued, so callers can tag events (e.g. with a conversation generation).
pub fn spawn_feed<T, F>(
    kind: FeedKind,
    url: String,
    policy: ReconnectPolicy,
    tx: mpsc::UnboundedSender<T>,
    wrap: F,
) -> FeedHandle
where
    T: Send + 'static,
    F: Fn(FeedEvent) -> T + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_feed(kind, url, policy, tx, wrap, shutdown_rx));
    FeedHandle {
        kind,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn run_feed<T, F>(
    kind: FeedKind,
    url: String,
    policy: ReconnectPolicy,
    tx: mpsc::UnboundedSender<T>,
    wrap: F,
    mut shutdown: oneshot::Receiver<()>,
) where
    F: Fn(FeedEvent) -> T,
{
    let shown = redact_token(&url);
    let emit = |event: FeedEvent| tx.send(wrap(event)).is_ok();
    let mut failures: u32 = 0;

    loop {
        if !emit(FeedEvent::State(FeedState::Connecting { attempt: failures })) {
            return;
        }

        let connected = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = &mut shutdown => {
                emit(FeedEvent::State(FeedState::Closed));
                return;
            }
        };

        match connected {
            Ok((ws, _)) => {
                info!("{} feed connected: {}", kind, shown);
                if !emit(FeedEvent::State(FeedState::Open)) {
                    return;
                }
                let opened_at = Instant::now();
                let mut delivered = false;
                let (mut write, mut read) = ws.split();

                loop {
                    tokio::select! {
                        _ = &mut shutdown => {
                            let _ = write.send(Message::Close(None)).await;
                            debug!("{} feed closed by owner", kind);
                            emit(FeedEvent::State(FeedState::Closed));
                            return;
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                delivered = true;
                                if !emit(FeedEvent::Frame(text.to_string())) {
                                    return;
                                }
                            }
                            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                                Ok(text) => {
                                    delivered = true;
                                    if !emit(FeedEvent::Frame(text)) {
                                        return;
                                    }
                                }
                                Err(_) => warn!("{} feed: dropping non-UTF-8 binary frame", kind),
                            },
                            Some(Ok(Message::Close(frame))) => {
                                info!("{} feed closed by server: {:?}", kind, frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("{} feed error: {}", kind, e);
                                emit(FeedEvent::State(FeedState::Failed { reason: e.to_string() }));
                                break;
                            }
                            None => break,
                        }
                    }
                }

                // Backoff restarts only after a connection that actually worked;
                // an upgrade followed by an immediate close keeps counting
                if delivered || opened_at.elapsed() >= policy.max_delay {
                    failures = 1;
                } else {
                    failures += 1;
                }
                if !emit(FeedEvent::State(FeedState::Closed)) {
                    return;
                }
            }
            Err(e) => {
                error!("{} feed connection to {} failed: {}", kind, shown, e);
                failures += 1;
                if !emit(FeedEvent::State(FeedState::Failed {
                    reason: e.to_string(),
                })) {
                    return;
                }
            }
        }

        if policy.gives_up_after(failures) {
            if policy.enabled {
                warn!("{} feed giving up after {} attempts", kind, failures);
            }
            return;
        }

        let delay = policy.jittered_delay(failures.saturating_sub(1));
        debug!("{} feed reconnecting in {:?}", kind, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                emit(FeedEvent::State(FeedState::Closed));
                return;
            }
        }
    }
}

/// Hide the bearer token carried in a feed URL
pub fn redact_token(url: &str) -> String {
    match url.find("token=") {
        Some(pos) => {
            let start = pos + "token=".len();
            let end = url[start..]
                .find('&')
                .map(|i| start + i)
                .unwrap_or(url.len());
            format!("{}***{}", &url[..start], &url[end..])
        }
        None => url.to_string(),
    }
}
