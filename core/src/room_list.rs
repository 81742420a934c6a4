/// Room list synchronizer: mirrors the backend's room feed into an ordered view.
///
/// The feed pushes either a bare JSON array (full snapshot) or an object
/// tagged `"event": "room_update"` (upsert by `room_id`). The list is kept
/// sorted by descending `last_message_id`, ties broken by descending `room_id`.
use crate::error::{ChatError, Result};
use crate::types::{ConversationSummary, RoomId, RoomUpdate};
use serde::Deserialize;
use std::cmp::Ordering;
use tracing::debug;

/// Decoded room-feed frame
#[derive(Debug, Clone, PartialEq)]
pub enum RoomFrame {
    Snapshot(Vec<ConversationSummary>),
    Update(RoomUpdate),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Snapshot(Vec<ConversationSummary>),
    Event(RawEvent),
}

#[derive(Deserialize)]
#[serde(tag = "event")]
enum RawEvent {
    #[serde(rename = "room_update")]
    RoomUpdate(RoomUpdate),
}

impl RoomFrame {
    /// Parse one text frame. Anything that is neither shape is a protocol error.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| {
            ChatError::Protocol(format!("unrecognized room feed frame: {}", e))
        })?;
        Ok(match raw {
            RawFrame::Snapshot(rooms) => RoomFrame::Snapshot(rooms),
            RawFrame::Event(RawEvent::RoomUpdate(update)) => RoomFrame::Update(update),
        })
    }
}

/// What an applied frame did to the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomChange {
    Replaced { len: usize },
    Updated(RoomId),
    Inserted(RoomId),
}

/// Ordered room list
#[derive(Debug, Default, Clone)]
pub struct RoomList {
    rooms: Vec<ConversationSummary>,
}

impl RoomList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooms(&self) -> &[ConversationSummary] {
        &self.rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn get(&self, room_id: RoomId) -> Option<&ConversationSummary> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }

    /// Parse and apply a raw feed frame. On error the list is untouched.
    pub fn apply_text(&mut self, text: &str) -> Result<RoomChange> {
        let frame = RoomFrame::parse(text)?;
        Ok(self.apply(frame))
    }

    pub fn apply(&mut self, frame: RoomFrame) -> RoomChange {
        match frame {
            RoomFrame::Snapshot(rooms) => self.replace(rooms),
            RoomFrame::Update(update) => self.upsert(update),
        }
    }

    /// Replace the whole view with a snapshot
    pub fn replace(&mut self, rooms: Vec<ConversationSummary>) -> RoomChange {
        self.rooms = rooms;
        self.sort();
        debug!("Room snapshot applied ({} rooms)", self.rooms.len());
        RoomChange::Replaced {
            len: self.rooms.len(),
        }
    }

    /// Update the matching room or append a new one
    pub fn upsert(&mut self, update: RoomUpdate) -> RoomChange {
        let room_id = update.room_id;
        let change = match self.rooms.iter_mut().find(|r| r.room_id == room_id) {
            Some(room) => {
                update.apply_to(room);
                RoomChange::Updated(room_id)
            }
            None => {
                self.rooms.push(update.into_summary());
                RoomChange::Inserted(room_id)
            }
        };
        self.sort();
        debug!("Room update applied: {:?}", change);
        change
    }

    fn sort(&mut self) {
        self.rooms.sort_by(recency_order);
    }
}

/// Descending recency, then descending room id
pub fn recency_order(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    b.recency()
        .cmp(&a.recency())
        .then_with(|| b.room_id.cmp(&a.room_id))
}
