use crate::types::{CallbackId, ChatId, InboundEvent, MediaRef, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving updates. Push one event to `tx` per parsed update.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send a message and return the platform id of the sent message.
    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<MessageId>;

    /// Replace the text and buttons of a message the bot sent earlier.
    async fn edit(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()>;

    async fn delete(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()>;

    /// Acknowledge a button press. Adapters without callbacks keep the default.
    async fn answer_callback(&self, _callback_id: &CallbackId, _text: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Fetch the raw bytes behind a media reference.
    async fn download(&self, media: &MediaRef) -> Result<Bytes>;
}
