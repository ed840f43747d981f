//! Resolving reply-to events into collect items.
//!
//! Replying to anything, whether one of the bot's transcripts or one of the
//! user's own earlier messages, pulls the replied-to content into the owner's
//! collect session, opening one first when the policy allows it.

use crate::collect::{CollectItem, ItemKind};
use crate::error::{SessionError, SessionResult};
use crate::session::{MessageKey, SessionStore};
use vn_channels::{ChatId, MessageContent, RepliedMessage, SenderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// Open a collect session when a reply arrives and none is active.
    pub auto_collect: bool,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self { auto_collect: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// Replied content was appended. `degraded` means the bot message's
    /// transcript had expired and the item carries no payload.
    Attached {
        index: usize,
        kind: ItemKind,
        degraded: bool,
    },
    /// Replied message is still being transcribed; a placeholder was added
    /// and the pending entry now points at the session.
    PendingBridge { index: usize },
    Ignored { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyResolution {
    pub session_started: bool,
    pub target: ReplyTarget,
}

/// Resolve `replied` into the owner's collect session.
///
/// Runs without awaiting so the placeholder lands before any later event.
/// Fails with `NoActiveSession` only when no session exists and the policy
/// forbids opening one.
pub fn resolve_reply(
    store: &SessionStore,
    policy: ReplyPolicy,
    chat_id: &ChatId,
    owner: &SenderId,
    replied: &RepliedMessage,
) -> SessionResult<ReplyResolution> {
    let collect = store.collect();
    let session_started = if collect.is_active(owner) {
        false
    } else if policy.auto_collect {
        match collect.start(owner, chat_id) {
            Ok(_) => true,
            Err(SessionError::AlreadyActive) => false,
            Err(e) => return Err(e),
        }
    } else {
        return Err(SessionError::NoActiveSession);
    };

    let target = if replied.from_bot {
        resolve_bot_message(store, chat_id, owner, replied)?
    } else {
        resolve_user_message(store, chat_id, owner, replied)?
    };
    tracing::debug!(owner = %owner, replied = %replied.message_id, ?target, session_started, "reply resolved");
    Ok(ReplyResolution {
        session_started,
        target,
    })
}

fn resolve_bot_message(
    store: &SessionStore,
    chat_id: &ChatId,
    owner: &SenderId,
    replied: &RepliedMessage,
) -> SessionResult<ReplyTarget> {
    let Some(link) = store.links().resolve(chat_id, &replied.message_id) else {
        return Ok(ReplyTarget::Ignored {
            reason: "bot message has no linked content",
        });
    };
    if already_collected(store, owner, &link.origin_message_id) {
        return Ok(ReplyTarget::Ignored {
            reason: "content already collected",
        });
    }
    let kind = link
        .media
        .as_ref()
        .map(ItemKind::for_media)
        .unwrap_or(ItemKind::Text);
    let transcript = store
        .transcripts()
        .get(&MessageKey::new(chat_id, &link.origin_message_id));
    let degraded = transcript.is_none();
    if degraded {
        tracing::info!(
            owner = %owner,
            origin = %link.origin_message_id,
            "transcript expired; collecting without payload"
        );
    }
    let mut item = CollectItem::new(
        kind,
        transcript.map(|entry| entry.content),
        link.origin_message_id,
    );
    item.media = link.media;
    let index = store.collect().add_item(owner, item)?;
    Ok(ReplyTarget::Attached {
        index,
        kind,
        degraded,
    })
}

fn resolve_user_message(
    store: &SessionStore,
    chat_id: &ChatId,
    owner: &SenderId,
    replied: &RepliedMessage,
) -> SessionResult<ReplyTarget> {
    if already_collected(store, owner, &replied.message_id) {
        return Ok(ReplyTarget::Ignored {
            reason: "content already collected",
        });
    }
    let key = MessageKey::new(chat_id, &replied.message_id);

    let mut pending_media = None;
    store.pending().update(&key, |entry| {
        entry.attached_session = Some(owner.clone());
        pending_media = Some(entry.media.clone());
    });
    if let Some(media) = pending_media {
        let index = store
            .collect()
            .add_item(owner, CollectItem::pending(replied.message_id.clone(), media))?;
        return Ok(ReplyTarget::PendingBridge { index });
    }

    let cached = || store.transcripts().get(&key).map(|entry| entry.content);
    let item = match &replied.content {
        MessageContent::Text { text } => CollectItem::text(text.clone(), replied.message_id.clone()),
        MessageContent::Voice { media } | MessageContent::Video { media, .. } => {
            CollectItem::new(ItemKind::for_media(media), cached(), replied.message_id.clone())
                .with_media(media.clone())
        }
        MessageContent::Document { media, .. } if replied.content.is_video_document() => {
            CollectItem::new(ItemKind::Video, cached(), replied.message_id.clone())
                .with_media(media.clone())
        }
        MessageContent::Document { .. } => {
            return Ok(ReplyTarget::Ignored {
                reason: "document is not a video",
            });
        }
        MessageContent::Photo { .. } | MessageContent::Unsupported => {
            return Ok(ReplyTarget::Ignored {
                reason: "unsupported replied content",
            });
        }
    };
    let kind = item.kind;
    let degraded = kind != ItemKind::Text && item.payload.is_none();
    let index = store.collect().add_item(owner, item)?;
    Ok(ReplyTarget::Attached {
        index,
        kind,
        degraded,
    })
}

fn already_collected(
    store: &SessionStore,
    owner: &SenderId,
    source: &vn_channels::MessageId,
) -> bool {
    store
        .collect()
        .snapshot(owner)
        .is_some_and(|session| session.contains_source(source))
}
