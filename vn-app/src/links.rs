//! Bot-message to origin-message links.
//!
//! Every transcript or note reply the bot posts is linked back to the user
//! message it was produced from, so that a later reply to the bot message can
//! find the original content. Links are never evicted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use vn_channels::{ChatId, MediaRef, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLink {
    pub origin_message_id: MessageId,
    /// Media of the origin message; `None` for text notes.
    pub media: Option<MediaRef>,
    pub linked_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MessageLinkTable {
    links: DashMap<(ChatId, MessageId), MessageLink>,
}

impl MessageLinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `bot_message_id` was produced from `origin_message_id`.
    /// Re-linking the same bot message overwrites the earlier origin.
    pub fn link(
        &self,
        chat_id: &ChatId,
        bot_message_id: &MessageId,
        origin_message_id: &MessageId,
        media: Option<MediaRef>,
    ) {
        self.links.insert(
            (chat_id.clone(), bot_message_id.clone()),
            MessageLink {
                origin_message_id: origin_message_id.clone(),
                media,
                linked_at: Utc::now(),
            },
        );
    }

    pub fn resolve(&self, chat_id: &ChatId, bot_message_id: &MessageId) -> Option<MessageLink> {
        self.links
            .get(&(chat_id.clone(), bot_message_id.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vn_channels::MediaKind;

    #[test]
    fn resolves_origin_and_media() {
        let table = MessageLinkTable::new();
        let chat = ChatId::from(42);
        let media = MediaRef::new(MediaKind::Voice, "file-1");
        table.link(&chat, &MessageId::from(11), &MessageId::from(10), Some(media.clone()));

        let link = table.resolve(&chat, &MessageId::from(11)).expect("link");
        assert_eq!(link.origin_message_id, MessageId::from(10));
        assert_eq!(link.media, Some(media));
        assert!(table.resolve(&chat, &MessageId::from(10)).is_none());
    }

    #[test]
    fn links_are_scoped_per_chat() {
        let table = MessageLinkTable::new();
        table.link(&ChatId::from(1), &MessageId::from(5), &MessageId::from(4), None);
        assert!(table.resolve(&ChatId::from(2), &MessageId::from(5)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn relink_overwrites() {
        let table = MessageLinkTable::new();
        let chat = ChatId::from(1);
        table.link(&chat, &MessageId::from(5), &MessageId::from(4), None);
        table.link(&chat, &MessageId::from(5), &MessageId::from(3), None);
        assert_eq!(
            table.resolve(&chat, &MessageId::from(5)).map(|l| l.origin_message_id),
            Some(MessageId::from(3))
        );
        table.clear();
        assert!(table.is_empty());
    }
}
