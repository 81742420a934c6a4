/// Thread paginator: a newest-first window of messages for one conversation.
///
/// The window starts with the newest page and grows backward when the view
/// scrolls near its top. Live pushes merge in at the front. Every page
/// request carries a [`FetchToken`] stamped with the conversation generation,
/// so responses that arrive after a conversation switch are recognised and
/// dropped. At most one page request is outstanding at any time.
use crate::error::{ChatError, Result};
use crate::types::{MessageId, MessageRecord, Participant, RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const DEFAULT_SCROLL_THRESHOLD_PX: f64 = 100.0;

/// Identifies one page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchToken {
    pub generation: u64,
    pub seq: u64,
}

/// A page fetch the caller must perform and report back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub token: FetchToken,
    pub room_id: RoomId,
    pub limit: u32,
    /// Exclusive upper bound; `None` for the newest page
    pub before_id: Option<MessageId>,
}

/// Result of feeding a page response back into the paginator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Token did not match the outstanding request
    Stale,
    Applied { added: usize },
}

/// Decoded thread-feed frame. Decoded fully before anything is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadPush {
    pub participants: Vec<Participant>,
    pub messages: Vec<MessageRecord>,
}

impl ThreadPush {
    /// A frame may carry `users`, a `messages` batch, or be one message (has `id`).
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ChatError::Protocol(format!("thread frame is not JSON: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ChatError::Protocol("thread frame is not an object".to_string()))?;

        let has_batch = obj.contains_key("messages");
        let has_single = !has_batch && obj.contains_key("id");
        if !obj.contains_key("users") && !has_batch && !has_single {
            return Err(ChatError::Protocol(
                "thread frame carries neither users nor messages".to_string(),
            ));
        }

        let mut push = ThreadPush::default();
        if let Some(users) = obj.get("users") {
            push.participants = Vec::<Participant>::deserialize(users)
                .map_err(|e| ChatError::Protocol(format!("bad users in thread frame: {}", e)))?;
        }
        if let Some(batch) = obj.get("messages") {
            push.messages = Vec::<MessageRecord>::deserialize(batch)
                .map_err(|e| ChatError::Protocol(format!("bad message batch: {}", e)))?;
        } else if has_single {
            let msg = MessageRecord::deserialize(&value)
                .map_err(|e| ChatError::Protocol(format!("bad message: {}", e)))?;
            push.messages.push(msg);
        }
        Ok(push)
    }
}

/// What a push did to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    pub added: usize,
    pub participants: usize,
}

/// Serializable view of the open thread
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSnapshot {
    pub room_id: RoomId,
    pub generation: u64,
    /// Newest first
    pub messages: Vec<MessageRecord>,
    pub participants: HashMap<UserId, Participant>,
    pub loading: bool,
    pub reached_start: bool,
}

impl ThreadSnapshot {
    pub fn sender_name(&self, user: UserId) -> &str {
        self.participants
            .get(&user)
            .map(|p| p.name.as_str())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug)]
pub struct ThreadPaginator {
    page_size: u32,
    scroll_threshold: f64,
    room_id: Option<RoomId>,
    generation: u64,
    next_seq: u64,
    in_flight: Option<FetchToken>,
    reached_start: bool,
    messages: Vec<MessageRecord>,
    seen: HashSet<MessageId>,
    participants: HashMap<UserId, Participant>,
}

impl Default for ThreadPaginator {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, DEFAULT_SCROLL_THRESHOLD_PX)
    }
}

impl ThreadPaginator {
    pub fn new(page_size: u32, scroll_threshold: f64) -> Self {
        Self {
            page_size: page_size.max(1),
            scroll_threshold,
            room_id: None,
            generation: 0,
            next_seq: 0,
            in_flight: None,
            reached_start: false,
            messages: Vec::new(),
            seen: HashSet::new(),
            participants: HashMap::new(),
        }
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn reached_start(&self) -> bool {
        self.reached_start
    }

    /// Messages, newest first
    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn participants(&self) -> &HashMap<UserId, Participant> {
        &self.participants
    }

    /// Display name for a sender, "Unknown" when not in the lookup table
    pub fn sender_name(&self, user: UserId) -> &str {
        self.participants
            .get(&user)
            .map(|p| p.name.as_str())
            .unwrap_or("Unknown")
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    /// Open a conversation: discards the previous window and returns the
    /// request for its newest page.
    pub fn select(&mut self, room_id: RoomId) -> PageRequest {
        self.reset();
        self.room_id = Some(room_id);
        debug!("Thread {} opened (generation {})", room_id, self.generation);
        self.issue(room_id, None)
    }

    /// Tear down the open conversation, if any
    pub fn close(&mut self) -> Option<RoomId> {
        let closed = self.room_id;
        self.reset();
        closed
    }

    /// Report the scroll offset from the top of the loaded window.
    /// Returns a backward page request when one should be fetched now.
    pub fn on_scroll(&mut self, scroll_top: f64) -> Option<PageRequest> {
        if scroll_top >= self.scroll_threshold {
            return None;
        }
        let room_id = self.room_id?;
        if self.in_flight.is_some() {
            debug!("Scroll fetch dropped: request already in flight");
            return None;
        }
        if self.reached_start {
            return None;
        }
        let before = self.oldest_id()?;
        Some(self.issue(room_id, Some(before)))
    }

    /// Feed back a page response
    pub fn complete(&mut self, token: FetchToken, page: Vec<MessageRecord>) -> PageOutcome {
        if self.in_flight != Some(token) {
            return PageOutcome::Stale;
        }
        self.in_flight = None;

        if page.is_empty() {
            // seq 0 is the newest-page request of a generation
            if token.seq > 0 {
                self.reached_start = true;
            }
            return PageOutcome::Applied { added: 0 };
        }
        let added = self.merge(page);
        PageOutcome::Applied { added }
    }

    /// Release the in-flight guard after a failed request.
    /// Returns false when the token was stale.
    pub fn fail(&mut self, token: FetchToken) -> bool {
        if self.in_flight == Some(token) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Parse and apply a live-feed frame. On error nothing is applied.
    pub fn apply_text(&mut self, text: &str) -> Result<PushOutcome> {
        let push = ThreadPush::parse(text)?;
        Ok(self.apply_push(push))
    }

    pub fn apply_push(&mut self, push: ThreadPush) -> PushOutcome {
        let participants = push.participants.len();
        for p in push.participants {
            self.participants.insert(p.id, p);
        }
        let added = self.merge(push.messages);
        PushOutcome {
            added,
            participants,
        }
    }

    pub fn snapshot(&self) -> Option<ThreadSnapshot> {
        let room_id = self.room_id?;
        Some(ThreadSnapshot {
            room_id,
            generation: self.generation,
            messages: self.messages.clone(),
            participants: self.participants.clone(),
            loading: self.is_loading(),
            reached_start: self.reached_start,
        })
    }

    /// Insert unseen messages and restore newest-first order
    fn merge(&mut self, incoming: Vec<MessageRecord>) -> usize {
        let mut added = 0;
        for msg in incoming {
            if self.seen.insert(msg.id) {
                self.messages.push(msg);
                added += 1;
            }
        }
        if added > 0 {
            self.messages.sort_by(|a, b| b.id.cmp(&a.id));
        }
        added
    }

    fn issue(&mut self, room_id: RoomId, before_id: Option<MessageId>) -> PageRequest {
        let token = FetchToken {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.in_flight = Some(token);
        PageRequest {
            token,
            room_id,
            limit: self.page_size,
            before_id,
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.next_seq = 0;
        self.room_id = None;
        self.in_flight = None;
        self.reached_start = false;
        self.messages.clear();
        self.seen.clear();
        self.participants.clear();
    }
}
