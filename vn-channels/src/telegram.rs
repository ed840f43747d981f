use crate::traits::ChannelAdapter;
use crate::types::{
    CallbackId, CallbackQuery, ChatId, InboundEvent, InboundMessage, MediaKind, MediaRef,
    MessageContent, MessageId, OutboundMessage, RepliedMessage,
};
use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{TELEGRAM_API_BASE}/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    fn file_url(&self, file_path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{TELEGRAM_API_BASE}/file/bot{}/{}",
            self.bot_token, file_path
        ))?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let parsed: TelegramApiResponse<T> = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!("telegram {method} returned unparseable body: status={status} error={e}")
        })?;
        if !status.is_success() || !parsed.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} description={}",
                parsed.description.unwrap_or_default()
            ));
        }
        parsed
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned ok without result"))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<MessageId> {
        let mut body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "text": clamp_text(&message.content),
        });
        if let Some(reply_to) = message.reply_to_message_id.as_ref() {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to.as_str().parse::<i64>().unwrap_or_default(),
                "allow_sending_without_reply": true,
            });
        }
        if !message.buttons.is_empty() {
            body["reply_markup"] = inline_keyboard(&message);
        }
        let sent: TelegramSentMessage = self.call("sendMessage", body).await?;
        Ok(MessageId::from(sent.message_id))
    }

    async fn edit(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "message_id": message_id.as_str().parse::<i64>()?,
            "text": clamp_text(&message.content),
            "reply_markup": inline_keyboard(&message),
        });
        // editMessageText answers with the edited message or `true`.
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn delete(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "message_id": message_id.as_str().parse::<i64>()?,
        });
        let _: bool = self.call("deleteMessage", body).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &CallbackId, text: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id.as_str() });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.to_string());
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }

    async fn download(&self, media: &MediaRef) -> Result<Bytes> {
        let file: TelegramFile = self
            .call("getFile", serde_json::json!({ "file_id": media.file_id }))
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow::anyhow!("telegram getFile returned no file_path"))?;
        let resp = self.http.get(self.file_url(&file_path)?).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram file download failed: status={status}"
            ));
        }
        Ok(resp.bytes().await?)
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramApiResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(event) = build_inbound_event(&update) else {
                    tracing::debug!(update_id = update.update_id, "telegram update skipped");
                    continue;
                };
                tx.send(event)
                    .await
                    .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn clamp_text(text: &str) -> String {
    if text.chars().count() <= TELEGRAM_MAX_TEXT_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(TELEGRAM_MAX_TEXT_CHARS - 1).collect();
    out.push('…');
    out
}

fn inline_keyboard(message: &OutboundMessage) -> serde_json::Value {
    let rows: Vec<Vec<serde_json::Value>> = message
        .buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| {
                    serde_json::json!({ "text": button.label, "callback_data": button.data })
                })
                .collect()
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

fn build_inbound_event(update: &TelegramUpdate) -> Option<InboundEvent> {
    if let Some(message) = update.message.as_ref() {
        return build_message_inbound(update.update_id, message).map(InboundEvent::from_message);
    }
    if let Some(query) = update.callback_query.as_ref() {
        return build_callback_inbound(query).map(InboundEvent::Callback);
    }
    None
}

fn build_message_inbound(update_id: i64, message: &TelegramMessage) -> Option<InboundMessage> {
    let chat = message.chat.as_ref()?;
    let content = extract_message_content(message);
    if content == MessageContent::Unsupported {
        return None;
    }
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));
    let reply_to = message.reply_to_message.as_deref().and_then(|replied| {
        Some(RepliedMessage {
            message_id: MessageId::from(replied.message_id?),
            from_bot: replied.from.as_ref().is_some_and(|user| user.is_bot),
            content: extract_message_content(replied),
        })
    });

    Some(InboundMessage {
        message_id: message_id.into(),
        chat_id: ChatId::from(chat.id),
        sender_id: sender_id.into(),
        content,
        reply_to,
        received_at: Utc::now(),
    })
}

fn build_callback_inbound(query: &TelegramCallbackQuery) -> Option<CallbackQuery> {
    let data = query.data.as_deref()?.trim();
    if data.is_empty() {
        return None;
    }
    let message = query.message.as_ref();
    let chat_id = message
        .and_then(|m| m.chat.as_ref())
        .map(|chat| ChatId::from(chat.id))
        .unwrap_or_else(|| ChatId::from(query.from.id));
    Some(CallbackQuery {
        callback_id: CallbackId::new(query.id.clone()),
        chat_id,
        sender_id: query.from.id.into(),
        message_id: message.and_then(|m| m.message_id).map(MessageId::from),
        data: data.to_string(),
        received_at: Utc::now(),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn extract_message_content(message: &TelegramMessage) -> MessageContent {
    let caption = non_empty(message.caption.as_deref());
    if let Some(voice) = message.voice.as_ref() {
        return MessageContent::Voice {
            media: voice.to_media(MediaKind::Voice),
        };
    }
    if let Some(audio) = message.audio.as_ref() {
        return MessageContent::Voice {
            media: audio.to_media(MediaKind::Audio),
        };
    }
    if let Some(video) = message.video.as_ref() {
        return MessageContent::Video {
            media: video.to_media(MediaKind::Video),
            caption,
        };
    }
    if let Some(note) = message.video_note.as_ref() {
        return MessageContent::Video {
            media: note.to_media(MediaKind::VideoNote),
            caption,
        };
    }
    if let Some(document) = message.document.as_ref() {
        return MessageContent::Document {
            media: document.to_media(MediaKind::Document),
            caption,
        };
    }
    // Telegram lists photo sizes ascending; keep the largest.
    if let Some(photo) = message.photo.last() {
        return MessageContent::Photo {
            media: photo.to_media(MediaKind::Photo),
            caption,
        };
    }
    if let Some(text) = non_empty(message.text.as_deref()) {
        return MessageContent::Text { text };
    }
    MessageContent::Unsupported
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TelegramFileRef>,
    #[serde(default)]
    audio: Option<TelegramFileRef>,
    #[serde(default)]
    document: Option<TelegramFileRef>,
    #[serde(default)]
    video: Option<TelegramFileRef>,
    #[serde(default)]
    voice: Option<TelegramFileRef>,
    #[serde(default)]
    video_note: Option<TelegramFileRef>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct TelegramFileRef {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    duration: Option<u32>,
}

impl TelegramFileRef {
    fn to_media(&self, kind: MediaKind) -> MediaRef {
        MediaRef {
            kind,
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            duration_secs: self.duration,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}
