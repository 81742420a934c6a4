/// View runtime: owns the room list and the open thread.
///
/// Feed frames, page responses and UI commands all arrive on one queue and
/// are applied one at a time, so the view state needs no locking. Network
/// work runs in spawned tasks that report back through the same queue.
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::feed::{spawn_feed, FeedEvent, FeedHandle, FeedKind, FeedState, ReconnectPolicy};
use crate::room_list::RoomList;
use crate::thread::{FetchToken, PageOutcome, PageRequest, ThreadPaginator, ThreadSnapshot};
use crate::types::{ConversationSummary, MessageRecord, RoomId, ViewEvent};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

const VIEW_EVENT_CAPACITY: usize = 256;

/// Everything the runtime reacts to
pub enum RuntimeEvent {
    RoomFeed(FeedEvent),
    /// Tagged with the thread generation the feed was opened for
    ThreadFeed { generation: u64, event: FeedEvent },
    PageLoaded {
        token: FetchToken,
        result: Result<Vec<MessageRecord>>,
    },
    Command(Command),
}

pub enum Command {
    SelectRoom(RoomId),
    CloseRoom,
    Scroll { scroll_top: f64 },
    Rooms(oneshot::Sender<Vec<ConversationSummary>>),
    Thread(oneshot::Sender<Option<ThreadSnapshot>>),
    Status(oneshot::Sender<RuntimeStatus>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub rooms_feed: Option<FeedState>,
    pub thread_feed: Option<FeedState>,
    pub open_room: Option<RoomId>,
    pub room_count: usize,
}

/// Cloneable front door to a running [`ChatRuntime`]
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
    views: broadcast::Sender<ViewEvent>,
}

impl ChatHandle {
    pub fn select_room(&self, room_id: RoomId) -> Result<()> {
        self.command(Command::SelectRoom(room_id))
    }

    pub fn close_room(&self) -> Result<()> {
        self.command(Command::CloseRoom)
    }

    /// Report the thread's scroll offset from the top, in pixels
    pub fn scroll(&self, scroll_top: f64) -> Result<()> {
        self.command(Command::Scroll { scroll_top })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub async fn rooms(&self) -> Result<Vec<ConversationSummary>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Rooms(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn thread(&self) -> Result<Option<ThreadSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Thread(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn status(&self) -> Result<RuntimeStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Status(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.views.subscribe()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(RuntimeEvent::Command(command))
            .map_err(|_| stopped())
    }
}

fn stopped() -> ChatError {
    ChatError::Connection("chat runtime is not running".to_string())
}

pub struct ChatRuntime {
    backend: Backend,
    reconnect: ReconnectPolicy,
    rooms: RoomList,
    thread: ThreadPaginator,
    tx: mpsc::UnboundedSender<RuntimeEvent>,
    rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    views: broadcast::Sender<ViewEvent>,
    room_feed: Option<FeedHandle>,
    thread_feed: Option<FeedHandle>,
    room_feed_state: Option<FeedState>,
    thread_feed_state: Option<FeedState>,
}

impl ChatRuntime {
    pub fn new(config: &Config, backend: Backend) -> (Self, ChatHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (views, _) = broadcast::channel(VIEW_EVENT_CAPACITY);
        let handle = ChatHandle {
            tx: tx.clone(),
            views: views.clone(),
        };
        let runtime = Self {
            backend,
            reconnect: config.reconnect.clone(),
            rooms: RoomList::new(),
            thread: ThreadPaginator::new(config.page_size, config.scroll_threshold_px),
            tx,
            rx,
            views,
            room_feed: None,
            thread_feed: None,
            room_feed_state: None,
            thread_feed_state: None,
        };
        (runtime, handle)
    }

    /// Activate the room feed and process events until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!("Chat runtime started against {}", self.backend.api_url());
        self.room_feed = Some(spawn_feed(
            FeedKind::Rooms,
            self.backend.rooms_feed_url(),
            self.reconnect.clone(),
            self.tx.clone(),
            RuntimeEvent::RoomFeed,
        ));

        while let Some(event) = self.rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        if let Some(feed) = self.thread_feed.take() {
            feed.close().await;
        }
        if let Some(feed) = self.room_feed.take() {
            feed.close().await;
        }
        info!("Chat runtime stopped");
        Ok(())
    }

    /// Apply one event. Returns false on shutdown.
    fn handle(&mut self, event: RuntimeEvent) -> bool {
        match event {
            RuntimeEvent::RoomFeed(FeedEvent::Frame(text)) => self.on_room_frame(&text),
            RuntimeEvent::RoomFeed(FeedEvent::State(state)) => {
                self.room_feed_state = Some(state.clone());
                self.publish(ViewEvent::FeedState {
                    feed: FeedKind::Rooms,
                    state,
                });
            }
            RuntimeEvent::ThreadFeed { generation, event } => {
                if generation != self.thread.generation() || self.thread.room_id().is_none() {
                    debug!("Ignoring thread feed event from generation {}", generation);
                    return true;
                }
                match event {
                    FeedEvent::Frame(text) => self.on_thread_frame(&text),
                    FeedEvent::State(state) => {
                        self.thread_feed_state = Some(state.clone());
                        self.publish(ViewEvent::FeedState {
                            feed: FeedKind::Thread,
                            state,
                        });
                    }
                }
            }
            RuntimeEvent::PageLoaded { token, result } => self.on_page(token, result),
            RuntimeEvent::Command(command) => return self.on_command(command),
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::SelectRoom(room_id) => self.open_thread(room_id),
            Command::CloseRoom => self.close_thread(),
            Command::Scroll { scroll_top } => {
                if let Some(request) = self.thread.on_scroll(scroll_top) {
                    debug!(
                        "Scroll at {:.0}px: fetching messages before {:?}",
                        scroll_top, request.before_id
                    );
                    self.spawn_fetch(request);
                    self.publish_thread();
                }
            }
            Command::Rooms(reply) => {
                let _ = reply.send(self.rooms.rooms().to_vec());
            }
            Command::Thread(reply) => {
                let _ = reply.send(self.thread.snapshot());
            }
            Command::Status(reply) => {
                let _ = reply.send(RuntimeStatus {
                    rooms_feed: self.room_feed_state.clone(),
                    thread_feed: self.thread_feed_state.clone(),
                    open_room: self.thread.room_id(),
                    room_count: self.rooms.len(),
                });
            }
            Command::Shutdown => {
                info!("Chat runtime shutting down");
                return false;
            }
        }
        true
    }

    fn on_room_frame(&mut self, text: &str) {
        match self.rooms.apply_text(text) {
            Ok(change) => {
                debug!("Room list changed: {:?}", change);
                self.publish(ViewEvent::RoomsUpdated {
                    rooms: self.rooms.rooms().to_vec(),
                });
            }
            Err(e) => warn!("Discarding room feed frame: {}", e),
        }
    }

    fn on_thread_frame(&mut self, text: &str) {
        match self.thread.apply_text(text) {
            Ok(outcome) => {
                if outcome.added > 0 || outcome.participants > 0 {
                    self.publish_thread();
                }
            }
            Err(e) => warn!("Discarding thread feed frame: {}", e),
        }
    }

    fn on_page(&mut self, token: FetchToken, result: Result<Vec<MessageRecord>>) {
        match result {
            Ok(page) => match self.thread.complete(token, page) {
                PageOutcome::Stale => debug!("Dropping stale page {:?}", token),
                PageOutcome::Applied { added } => {
                    debug!("Page {:?} added {} messages", token, added);
                    self.publish_thread();
                }
            },
            Err(e) => {
                if self.thread.fail(token) {
                    error!("Error fetching messages: {}", e);
                    self.publish_thread();
                } else {
                    debug!("Stale page request {:?} failed: {}", token, e);
                }
            }
        }
    }

    fn open_thread(&mut self, room_id: RoomId) {
        // The previous conversation's feed goes away before the new load starts.
        self.drop_thread_feed();
        if let Some(previous) = self.thread.room_id() {
            self.publish(ViewEvent::ThreadClosed { room_id: previous });
        }

        let request = self.thread.select(room_id);
        let generation = self.thread.generation();
        info!("Opening thread {} (generation {})", room_id, generation);
        self.spawn_fetch(request);

        self.thread_feed = Some(spawn_feed(
            FeedKind::Thread,
            self.backend.thread_feed_url(room_id),
            self.reconnect.clone(),
            self.tx.clone(),
            move |event| RuntimeEvent::ThreadFeed { generation, event },
        ));
        self.publish_thread();
    }

    fn close_thread(&mut self) {
        self.drop_thread_feed();
        if let Some(room_id) = self.thread.close() {
            info!("Closed thread {}", room_id);
            self.publish(ViewEvent::ThreadClosed { room_id });
        }
    }

    fn drop_thread_feed(&mut self) {
        if let Some(feed) = self.thread_feed.take() {
            debug!("Closing {} feed", feed.kind());
            drop(feed);
        }
        self.thread_feed_state = None;
    }

    fn spawn_fetch(&self, request: PageRequest) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = backend
                .fetch_messages(request.room_id, request.limit, request.before_id)
                .await;
            let _ = tx.send(RuntimeEvent::PageLoaded {
                token: request.token,
                result,
            });
        });
    }

    fn publish_thread(&self) {
        if let Some(thread) = self.thread.snapshot() {
            self.publish(ViewEvent::ThreadUpdated { thread });
        }
    }

    fn publish(&self, event: ViewEvent) {
        // No subscribers is fine.
        let _ = self.views.send(event);
    }
}
