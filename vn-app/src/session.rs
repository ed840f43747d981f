//! Owner of every per-run table the orchestrator reads and writes.
//!
//! Constructed once in `server.rs` and shared behind an `Arc`.

use crate::cache::ExpiringCache;
use crate::collect::CollectRegistry;
use crate::dedup::CallbackDeduplicator;
use crate::links::MessageLinkTable;
use crate::tags::TagWorkflows;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use vn_channels::{ChatId, MediaRef, MessageId, SenderId};

/// A chat message addressed by chat and message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageKey {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageKey {
    pub fn new(chat_id: &ChatId, message_id: &MessageId) -> Self {
        Self {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptMode {
    Raw,
    Improved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Voice,
    Video,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub title: String,
    pub content: String,
    pub captured_at: DateTime<Utc>,
    pub owner: SenderId,
    pub mode: TranscriptMode,
    pub source: TranscriptSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub media: MediaRef,
    /// Collect session waiting on this transcription, if any.
    pub attached_session: Option<SenderId>,
}

/// Messages a finished collect session offers to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOffer {
    pub chat_id: ChatId,
    pub owner: SenderId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTtls {
    pub transcript: Duration,
    pub pending: Duration,
    pub cleanup: Duration,
}

impl Default for StoreTtls {
    fn default() -> Self {
        Self {
            transcript: Duration::from_secs(30 * 60),
            pending: Duration::from_secs(10 * 60),
            cleanup: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub collect_sessions: usize,
    pub tag_workflows: usize,
    pub transcripts: usize,
    pub pending: usize,
    pub links: usize,
    pub callbacks_seen: usize,
    pub cleanup_offers: usize,
}

pub struct SessionStore {
    ttls: StoreTtls,
    collect: CollectRegistry,
    tags: TagWorkflows,
    transcripts: ExpiringCache<MessageKey, TranscriptEntry>,
    pending: ExpiringCache<MessageKey, PendingEntry>,
    links: MessageLinkTable,
    callbacks: CallbackDeduplicator,
    cleanups: ExpiringCache<String, CleanupOffer>,
}

impl SessionStore {
    pub fn new(ttls: StoreTtls) -> Self {
        Self {
            ttls,
            collect: CollectRegistry::new(),
            tags: TagWorkflows::new(),
            transcripts: ExpiringCache::new(),
            pending: ExpiringCache::new(),
            links: MessageLinkTable::new(),
            callbacks: CallbackDeduplicator::new(),
            cleanups: ExpiringCache::new(),
        }
    }

    pub fn ttls(&self) -> StoreTtls {
        self.ttls
    }

    pub fn collect(&self) -> &CollectRegistry {
        &self.collect
    }

    pub fn tags(&self) -> &TagWorkflows {
        &self.tags
    }

    pub fn transcripts(&self) -> &ExpiringCache<MessageKey, TranscriptEntry> {
        &self.transcripts
    }

    pub fn pending(&self) -> &ExpiringCache<MessageKey, PendingEntry> {
        &self.pending
    }

    pub fn links(&self) -> &MessageLinkTable {
        &self.links
    }

    pub fn callbacks(&self) -> &CallbackDeduplicator {
        &self.callbacks
    }

    pub fn cleanups(&self) -> &ExpiringCache<String, CleanupOffer> {
        &self.cleanups
    }

    pub fn remember_transcript(&self, key: MessageKey, entry: TranscriptEntry) {
        self.transcripts.put(key, entry, self.ttls.transcript);
    }

    pub fn mark_pending(&self, key: MessageKey, entry: PendingEntry) {
        self.pending.put(key, entry, self.ttls.pending);
    }

    /// Store a cleanup offer and return the token its buttons carry.
    pub fn offer_cleanup(&self, offer: CleanupOffer) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.cleanups.put(token.clone(), offer, self.ttls.cleanup);
        token
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            collect_sessions: self.collect.len(),
            tag_workflows: self.tags.len(),
            transcripts: self.transcripts.len(),
            pending: self.pending.len(),
            links: self.links.len(),
            callbacks_seen: self.callbacks.len(),
            cleanup_offers: self.cleanups.len(),
        }
    }

    /// Drop all state. Used between test scenarios.
    #[cfg(test)]
    pub fn clear(&self) {
        self.collect.clear();
        self.tags.clear();
        self.transcripts.clear();
        self.pending.clear();
        self.links.clear();
        self.callbacks.clear();
        self.cleanups.clear();
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(StoreTtls::default())
    }
}
