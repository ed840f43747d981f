use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChatId);
id_newtype!(SenderId);
id_newtype!(CallbackId);

/// Container extensions accepted as video when sent as a plain document.
pub const VIDEO_FILE_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "mkv", "webm", "avi"];

pub fn is_video_file_name(file_name: &str) -> bool {
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return false;
    };
    VIDEO_FILE_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Audio,
    Video,
    VideoNote,
    Photo,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

impl MediaRef {
    pub fn new(kind: MediaKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            file_name: None,
            mime_type: None,
            duration_secs: None,
        }
    }

    /// File name handed to transcription services, which sniff the format
    /// from the extension.
    pub fn upload_file_name(&self) -> String {
        if let Some(name) = self.file_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let ext = match self.kind {
            MediaKind::Voice => "ogg",
            MediaKind::Audio => "mp3",
            MediaKind::Video | MediaKind::VideoNote => "mp4",
            MediaKind::Photo => "jpg",
            MediaKind::Document => "bin",
        };
        format!("{}.{ext}", self.file_id)
    }

    /// True for media whose audio track can be transcribed.
    pub fn is_transcribable(&self) -> bool {
        match self.kind {
            MediaKind::Voice | MediaKind::Audio | MediaKind::Video | MediaKind::VideoNote => true,
            MediaKind::Document => self.file_name.as_deref().is_some_and(is_video_file_name),
            MediaKind::Photo => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Voice {
        media: MediaRef,
    },
    Video {
        media: MediaRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Photo {
        media: MediaRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Document {
        media: MediaRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Unsupported,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn media(&self) -> Option<&MediaRef> {
        match self {
            Self::Voice { media }
            | Self::Video { media, .. }
            | Self::Photo { media, .. }
            | Self::Document { media, .. } => Some(media),
            Self::Text { .. } | Self::Unsupported => None,
        }
    }

    pub fn caption(&self) -> Option<&str> {
        match self {
            Self::Video { caption, .. }
            | Self::Photo { caption, .. }
            | Self::Document { caption, .. } => caption.as_deref(),
            Self::Text { .. } | Self::Voice { .. } | Self::Unsupported => None,
        }
    }

    /// A document whose file name says it is a video container.
    pub fn is_video_document(&self) -> bool {
        match self {
            Self::Document { media, .. } => {
                media.file_name.as_deref().is_some_and(is_video_file_name)
            }
            _ => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::Photo { .. } => "photo",
            Self::Document { .. } => "document",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepliedMessage {
    pub message_id: MessageId,
    pub from_bot: bool,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    pub content: MessageContent,
    #[serde(default)]
    pub reply_to: Option<RepliedMessage>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundCommand {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    /// Lowercase command name without the slash or `@botname` suffix.
    pub name: String,
    #[serde(default)]
    pub args: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub callback_id: CallbackId,
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    /// The bot message carrying the pressed button.
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub data: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(InboundMessage),
    Reply(InboundMessage),
    Command(InboundCommand),
    Callback(CallbackQuery),
}

impl InboundEvent {
    /// Classify a parsed message: slash text is a command, anything with a
    /// reply target is a reply, the rest is a plain message.
    pub fn from_message(message: InboundMessage) -> Self {
        if let MessageContent::Text { text } = &message.content {
            if let Some((name, args)) = parse_command(text) {
                return Self::Command(InboundCommand {
                    message_id: message.message_id,
                    chat_id: message.chat_id,
                    sender_id: message.sender_id,
                    name,
                    args,
                    received_at: message.received_at,
                });
            }
        }
        if message.reply_to.is_some() {
            return Self::Reply(message);
        }
        Self::Message(message)
    }

    pub fn sender_id(&self) -> &SenderId {
        match self {
            Self::Message(m) | Self::Reply(m) => &m.sender_id,
            Self::Command(c) => &c.sender_id,
            Self::Callback(q) => &q.sender_id,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::Message(m) | Self::Reply(m) => &m.chat_id,
            Self::Command(c) => &c.chat_id,
            Self::Callback(q) => &q.chat_id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Reply(_) => "reply",
            Self::Command(_) => "command",
            Self::Callback(_) => "callback",
        }
    }
}

fn parse_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, args.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub label: String,
    pub data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    /// Inline keyboard rows. Empty on an edit clears existing buttons.
    #[serde(default)]
    pub buttons: Vec<Vec<InlineButton>>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn replying_to(mut self, message_id: &MessageId) -> Self {
        self.reply_to_message_id = Some(message_id.clone());
        self
    }

    pub fn with_buttons(mut self, rows: Vec<Vec<InlineButton>>) -> Self {
        self.buttons = rows;
        self
    }
}
