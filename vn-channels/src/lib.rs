//! Chat transport boundary for VoxNote.
//!
//! Adapters are pure I/O: they parse platform updates into the closed
//! [`InboundEvent`] set once, and carry [`OutboundMessage`]s back out.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    CallbackId, CallbackQuery, ChatId, InboundCommand, InboundEvent, InboundMessage, InlineButton,
    MediaKind, MediaRef, MessageContent, MessageId, OutboundMessage, RepliedMessage, SenderId,
    VIDEO_FILE_EXTENSIONS, is_video_file_name,
};
