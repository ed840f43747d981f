//! Collect sessions: one per owner, accumulating mixed content into a single
//! note until `/done` or `/cancel`.
//!
//! A session lives in the registry only while it is collecting. `finalize`
//! and `cancel` remove it and hand back the terminal snapshot, so no caller
//! can observe a finalized or cancelled session in the table.

use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;
use vn_channels::{ChatId, MediaKind, MediaRef, MessageId, SenderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Text,
    Voice,
    Photo,
    Video,
    Document,
    /// Placeholder for content whose transcription is still running.
    Pending,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Pending => "pending",
        }
    }

    /// Kind a media reference settles into once transcribed.
    pub fn for_media(media: &MediaRef) -> Self {
        match media.kind {
            MediaKind::Voice | MediaKind::Audio => Self::Voice,
            MediaKind::Video | MediaKind::VideoNote => Self::Video,
            MediaKind::Photo => Self::Photo,
            MediaKind::Document if media.is_transcribable() => Self::Video,
            MediaKind::Document => Self::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectItem {
    pub kind: ItemKind,
    /// Text or transcript. `None` when no transcript could be recovered.
    pub payload: Option<String>,
    pub source_message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    pub captured_at: DateTime<Utc>,
}

impl CollectItem {
    pub fn new(kind: ItemKind, payload: Option<String>, source_message_id: MessageId) -> Self {
        Self {
            kind,
            payload,
            source_message_id,
            media: None,
            captured_at: Utc::now(),
        }
    }

    pub fn text(text: impl Into<String>, source_message_id: MessageId) -> Self {
        Self::new(ItemKind::Text, Some(text.into()), source_message_id)
    }

    pub fn pending(source_message_id: MessageId, media: MediaRef) -> Self {
        Self::new(ItemKind::Pending, None, source_message_id).with_media(media)
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    UserContent,
    BotNotification,
    BotResponse,
    FinalResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedMessage {
    pub message_id: MessageId,
    pub role: MessageRole,
}

#[derive(Debug, Clone)]
pub struct CollectSession {
    pub id: Uuid,
    pub owner: SenderId,
    pub channel: ChatId,
    pub started_at: DateTime<Utc>,
    items: Vec<CollectItem>,
    counts_by_kind: BTreeMap<ItemKind, usize>,
    tracked_messages: Vec<TrackedMessage>,
}

impl CollectSession {
    fn new(owner: SenderId, channel: ChatId) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            channel,
            started_at: Utc::now(),
            items: Vec::new(),
            counts_by_kind: BTreeMap::new(),
            tracked_messages: Vec::new(),
        }
    }

    pub fn items(&self) -> &[CollectItem] {
        &self.items
    }

    pub fn counts_by_kind(&self) -> &BTreeMap<ItemKind, usize> {
        &self.counts_by_kind
    }

    pub fn tracked_messages(&self) -> &[TrackedMessage] {
        &self.tracked_messages
    }

    pub fn pending_count(&self) -> usize {
        self.counts_by_kind
            .get(&ItemKind::Pending)
            .copied()
            .unwrap_or(0)
    }

    pub fn contains_source(&self, source_message_id: &MessageId) -> bool {
        self.items
            .iter()
            .any(|item| &item.source_message_id == source_message_id)
    }

    fn push_item(&mut self, item: CollectItem) -> usize {
        *self.counts_by_kind.entry(item.kind).or_insert(0) += 1;
        self.items.push(item);
        self.items.len() - 1
    }

    fn resolve_pending(
        &mut self,
        source_message_id: &MessageId,
        kind: ItemKind,
        payload: Option<String>,
    ) -> usize {
        let mut replaced = 0;
        for item in self
            .items
            .iter_mut()
            .filter(|item| item.kind == ItemKind::Pending && &item.source_message_id == source_message_id)
        {
            item.kind = kind;
            item.payload = payload.clone();
            replaced += 1;
        }
        if replaced > 0 {
            if let Some(pending) = self.counts_by_kind.get_mut(&ItemKind::Pending) {
                *pending = pending.saturating_sub(replaced);
            }
            self.counts_by_kind.retain(|_, count| *count > 0);
            *self.counts_by_kind.entry(kind).or_insert(0) += replaced;
        }
        replaced
    }

    fn track(&mut self, message_id: MessageId, role: MessageRole) {
        if self
            .tracked_messages
            .iter()
            .any(|tracked| tracked.message_id == message_id)
        {
            return;
        }
        self.tracked_messages.push(TrackedMessage { message_id, role });
    }
}

/// Terminal snapshot produced by `finalize`.
#[derive(Debug, Clone)]
pub struct FinalizedSession {
    pub id: Uuid,
    pub owner: SenderId,
    pub channel: ChatId,
    pub started_at: DateTime<Utc>,
    pub items: Vec<CollectItem>,
    pub counts_by_kind: BTreeMap<ItemKind, usize>,
    pub tracked_messages: Vec<TrackedMessage>,
}

impl From<CollectSession> for FinalizedSession {
    fn from(session: CollectSession) -> Self {
        Self {
            id: session.id,
            owner: session.owner,
            channel: session.channel,
            started_at: session.started_at,
            items: session.items,
            counts_by_kind: session.counts_by_kind,
            tracked_messages: session.tracked_messages,
        }
    }
}

impl From<FinalizedSession> for CollectSession {
    fn from(finalized: FinalizedSession) -> Self {
        Self {
            id: finalized.id,
            owner: finalized.owner,
            channel: finalized.channel,
            started_at: finalized.started_at,
            items: finalized.items,
            counts_by_kind: finalized.counts_by_kind,
            tracked_messages: finalized.tracked_messages,
        }
    }
}

/// Owner-keyed table of collecting sessions.
#[derive(Default)]
pub struct CollectRegistry {
    sessions: DashMap<SenderId, CollectSession>,
}

impl CollectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. A second start never overwrites the live one.
    pub fn start(&self, owner: &SenderId, channel: &ChatId) -> SessionResult<Uuid> {
        match self.sessions.entry(owner.clone()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyActive),
            Entry::Vacant(slot) => {
                let session = CollectSession::new(owner.clone(), channel.clone());
                let id = session.id;
                slot.insert(session);
                tracing::info!(owner = %owner, chat = %channel, session_id = %id, "collect session started");
                Ok(id)
            }
        }
    }

    pub fn is_active(&self, owner: &SenderId) -> bool {
        self.sessions.contains_key(owner)
    }

    /// Read-only copy of the live session.
    pub fn snapshot(&self, owner: &SenderId) -> Option<CollectSession> {
        self.sessions.get(owner).map(|session| session.value().clone())
    }

    /// Append an item, returning its position.
    pub fn add_item(&self, owner: &SenderId, item: CollectItem) -> SessionResult<usize> {
        let mut session = self
            .sessions
            .get_mut(owner)
            .ok_or(SessionError::NoActiveSession)?;
        let kind = item.kind;
        let index = session.push_item(item);
        tracing::debug!(owner = %owner, kind = kind.as_str(), index, "collect item added");
        Ok(index)
    }

    /// Replace every pending placeholder for `source_message_id` in place.
    pub fn resolve_item(
        &self,
        owner: &SenderId,
        source_message_id: &MessageId,
        kind: ItemKind,
        payload: Option<String>,
    ) -> SessionResult<usize> {
        let mut session = self
            .sessions
            .get_mut(owner)
            .ok_or(SessionError::NoActiveSession)?;
        match session.resolve_pending(source_message_id, kind, payload) {
            0 => Err(SessionError::StaleReference(format!(
                "no pending item for message {source_message_id}"
            ))),
            replaced => Ok(replaced),
        }
    }

    pub fn track_message(
        &self,
        owner: &SenderId,
        message_id: &MessageId,
        role: MessageRole,
    ) -> SessionResult<()> {
        let mut session = self
            .sessions
            .get_mut(owner)
            .ok_or(SessionError::NoActiveSession)?;
        session.track(message_id.clone(), role);
        Ok(())
    }

    /// Remove a non-empty session and return its contents. An empty session
    /// stays open.
    pub fn finalize(&self, owner: &SenderId) -> SessionResult<FinalizedSession> {
        match self
            .sessions
            .remove_if(owner, |_, session| !session.items.is_empty())
        {
            Some((_, session)) => {
                tracing::info!(
                    owner = %owner,
                    session_id = %session.id,
                    items = session.items.len(),
                    "collect session finalized"
                );
                Ok(session.into())
            }
            None if self.sessions.contains_key(owner) => Err(SessionError::EmptySession),
            None => Err(SessionError::NoActiveSession),
        }
    }

    /// Put a finalized session back after a failed export, unless the owner
    /// already opened a new one.
    pub fn restore(&self, finalized: FinalizedSession) -> SessionResult<()> {
        match self.sessions.entry(finalized.owner.clone()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyActive),
            Entry::Vacant(slot) => {
                slot.insert(finalized.into());
                Ok(())
            }
        }
    }

    /// Discard the session, returning the messages it touched.
    pub fn cancel(&self, owner: &SenderId) -> SessionResult<Vec<TrackedMessage>> {
        let (_, session) = self
            .sessions
            .remove(owner)
            .ok_or(SessionError::NoActiveSession)?;
        tracing::info!(owner = %owner, session_id = %session.id, "collect session cancelled");
        Ok(session.tracked_messages)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.sessions.clear();
    }
}
