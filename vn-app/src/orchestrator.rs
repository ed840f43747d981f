//! Top-level event dispatcher.
//!
//! Each inbound event is handled in its own task. Handlers commit their
//! state changes synchronously before the first await, and re-read the
//! store after every external call, because other events for the same
//! owner may have been handled in between.

use crate::collect::{CollectItem, ItemKind, MessageRole, TrackedMessage};
use crate::commands::{self, CallbackAction, Command, HELP_TEXT};
use crate::error::{SessionError, SessionResult};
use crate::export;
use crate::reply::{self, ReplyPolicy, ReplyTarget};
use crate::session::{
    CleanupOffer, MessageKey, PendingEntry, SessionStore, TranscriptEntry, TranscriptMode,
    TranscriptSource,
};
use crate::tags::{TagSelection, TagSplit, display_tags, merge_with_marker};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use vn_channels::{
    CallbackQuery, ChannelAdapter, ChatId, InboundCommand, InboundEvent, InboundMessage,
    MediaKind, MediaRef, MessageContent, MessageId, OutboundMessage, SenderId,
};
use vn_services::{NoteVault, TextAssistant, Transcriber};

const STALE_TRANSCRIPT: &str =
    "⌛ That transcript is no longer cached. Send the message again to get a fresh one.";
const TAG_LIST_LIMIT: usize = 40;
const LOCAL_TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tag added to every exported note.
    pub marker_tag: String,
    pub vault_folder: String,
    pub reply_policy: ReplyPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            marker_tag: "voxnote".to_string(),
            vault_folder: "Inbox".to_string(),
            reply_policy: ReplyPolicy::default(),
        }
    }
}

/// Content staged into a collect session before any await.
enum Staged {
    Added { kind: ItemKind, total: usize },
    Transcribe(MediaRef),
    Skipped(&'static str),
}

pub struct SessionOrchestrator {
    store: Arc<SessionStore>,
    channel: Arc<dyn ChannelAdapter>,
    transcriber: Arc<dyn Transcriber>,
    assistant: Arc<dyn TextAssistant>,
    vault: Arc<dyn NoteVault>,
    settings: OrchestratorSettings,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        channel: Arc<dyn ChannelAdapter>,
        transcriber: Arc<dyn Transcriber>,
        assistant: Arc<dyn TextAssistant>,
        vault: Arc<dyn NoteVault>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            channel,
            transcriber,
            assistant,
            vault,
            settings,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(kind = event.kind_name(), chat = %event.chat_id(), sender = %event.sender_id())
    )]
    pub async fn handle(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Callback(query) => self.on_callback(query).await,
            InboundEvent::Command(command) => self.on_command(command).await,
            InboundEvent::Reply(message) => self.on_reply(message).await,
            InboundEvent::Message(message) => self.on_message(message).await,
        }
    }

    // ---- outbound helpers ----

    async fn say(
        &self,
        chat_id: &ChatId,
        text: impl Into<String>,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId> {
        let mut message = OutboundMessage::text(text);
        message.reply_to_message_id = reply_to.cloned();
        self.channel.send(chat_id, message).await
    }

    /// Send and record the message in the owner's collect session, if any.
    async fn notify(
        &self,
        chat_id: &ChatId,
        owner: &SenderId,
        text: impl Into<String>,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId> {
        let id = self.say(chat_id, text, reply_to).await?;
        self.track(owner, &id, MessageRole::BotNotification);
        Ok(id)
    }

    fn track(&self, owner: &SenderId, message_id: &MessageId, role: MessageRole) {
        // Outside a session there is nothing to track.
        let _ = self.store.collect().track_message(owner, message_id, role);
    }

    /// Turn a status message into `message`, falling back to a new message
    /// when there is no status message or the edit fails.
    async fn replace_status(
        &self,
        chat_id: &ChatId,
        status_id: Option<&MessageId>,
        message: OutboundMessage,
        reply_to: &MessageId,
    ) -> Result<MessageId> {
        if let Some(status_id) = status_id {
            match self.channel.edit(chat_id, status_id, message.clone()).await {
                Ok(()) => return Ok(status_id.clone()),
                Err(e) => tracing::warn!(%e, status = %status_id, "status edit failed; sending new message"),
            }
        }
        self.channel
            .send(chat_id, message.replying_to(reply_to))
            .await
    }

    async fn ack(&self, query: &CallbackQuery, text: Option<&str>) {
        if let Err(e) = self.channel.answer_callback(&query.callback_id, text).await {
            tracing::warn!(%e, callback_id = %query.callback_id, "answer_callback failed");
        }
    }

    async fn make_title(&self, text: &str, prefix: &str) -> String {
        let fallback = || format!("{prefix} {}", Utc::now().format("%Y-%m-%d %H:%M"));
        if text.trim().is_empty() {
            return fallback();
        }
        match self.assistant.title(text).await {
            Ok(title) if !title.trim().is_empty() => title.trim().to_string(),
            Ok(_) => fallback(),
            Err(e) => {
                tracing::warn!(%e, "title generation failed");
                fallback()
            }
        }
    }

    // ---- callbacks ----

    async fn on_callback(&self, query: CallbackQuery) -> Result<()> {
        if !self.store.callbacks().check_and_mark(query.callback_id.as_str()) {
            tracing::debug!(callback_id = %query.callback_id, "duplicate callback ignored");
            self.ack(&query, None).await;
            return Ok(());
        }
        let action = CallbackAction::parse(&query.data);
        let action_key = action.is_one_shot().then(|| {
            format!(
                "{}:{}:{}",
                query.chat_id,
                query.message_id.as_ref().map(MessageId::as_str).unwrap_or("-"),
                query.data
            )
        });
        if let Some(key) = action_key.as_deref() {
            if !self.store.callbacks().check_and_mark(key) {
                tracing::debug!(action = action.name(), "button already handled");
                self.ack(&query, Some("Already done")).await;
                return Ok(());
            }
        }
        tracing::info!(action = action.name(), "callback");

        let ack = match action {
            CallbackAction::Save(source) => {
                self.save_transcript(&query, &source, action_key.as_deref())
                    .await?
            }
            CallbackAction::SelectTags(source) => self.begin_tag_selection(&query, &source).await?,
            CallbackAction::Improve(source) => self.improve_transcript(&query, &source).await?,
            CallbackAction::ConfirmTags => self.confirm_tags(&query).await?,
            CallbackAction::CancelTags => self.cancel_tags(&query).await?,
            CallbackAction::Cleanup(token) => self.cleanup_messages(&query, &token).await?,
            CallbackAction::Keep(token) => self.keep_messages(&query, &token).await?,
            CallbackAction::Unknown => {
                tracing::warn!(data = %query.data, "unknown callback data");
                None
            }
        };
        self.ack(&query, ack).await;
        Ok(())
    }

    async fn save_transcript(
        &self,
        query: &CallbackQuery,
        source: &MessageId,
        action_key: Option<&str>,
    ) -> Result<Option<&'static str>> {
        let key = MessageKey::new(&query.chat_id, source);
        let Some(entry) = self.store.transcripts().get(&key) else {
            self.say(&query.chat_id, STALE_TRANSCRIPT, query.message_id.as_ref())
                .await?;
            return Ok(Some("Expired"));
        };
        let note = export::transcript_note(&entry, export::marker_tags(&self.settings.marker_tag));
        match self.vault.save_note(&self.settings.vault_folder, &note).await {
            Ok(receipt) => {
                tracing::info!(path = %receipt.path, source = %key, "transcript saved");
                self.say(
                    &query.chat_id,
                    format!("💾 Saved to {}", receipt.path),
                    query.message_id.as_ref(),
                )
                .await?;
                Ok(Some("Saved"))
            }
            Err(e) => {
                tracing::warn!(%e, source = %key, "vault export failed");
                if let Some(action_key) = action_key {
                    self.store.callbacks().forget(action_key);
                }
                self.say(
                    &query.chat_id,
                    format!("⚠️ Saving failed: {e}. Tap Save to try again."),
                    query.message_id.as_ref(),
                )
                .await?;
                Ok(Some("Save failed"))
            }
        }
    }

    async fn begin_tag_selection(
        &self,
        query: &CallbackQuery,
        source: &MessageId,
    ) -> Result<Option<&'static str>> {
        let key = MessageKey::new(&query.chat_id, source);
        let Some(entry) = self.store.transcripts().get(&key) else {
            self.say(&query.chat_id, STALE_TRANSCRIPT, query.message_id.as_ref())
                .await?;
            return Ok(Some("Expired"));
        };
        let available = match self.vault.list_tags().await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(%e, "listing vault tags failed; continuing without them");
                Vec::new()
            }
        };
        let recommended = match self
            .assistant
            .recommend_tags(&entry.content, &available)
            .await
        {
            Ok(raw) => TagSplit::from_classifier(&raw),
            Err(e) => {
                tracing::warn!(%e, "tag recommendation failed");
                TagSplit::default()
            }
        };

        let reply_to = query.message_id.clone().unwrap_or_else(|| source.clone());
        let list_message_id = self
            .say(
                &query.chat_id,
                tag_prompt(&available, &recommended),
                Some(&reply_to),
            )
            .await?;
        self.store.tags().begin_selection(
            &query.sender_id,
            TagSelection::new(
                key,
                list_message_id,
                query.message_id.clone(),
                available,
                recommended,
            ),
        );
        Ok(Some("Reply with your tags"))
    }

    async fn improve_transcript(
        &self,
        query: &CallbackQuery,
        source: &MessageId,
    ) -> Result<Option<&'static str>> {
        let key = MessageKey::new(&query.chat_id, source);
        let Some(entry) = self.store.transcripts().get(&key) else {
            self.say(&query.chat_id, STALE_TRANSCRIPT, query.message_id.as_ref())
                .await?;
            return Ok(Some("Expired"));
        };
        let improved = match self.assistant.improve(&entry.content).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => return Ok(Some("Nothing to improve")),
            Err(e) => {
                tracing::warn!(%e, source = %key, "readability rewrite failed");
                self.say(
                    &query.chat_id,
                    format!("⚠️ Couldn't improve the text: {e}"),
                    query.message_id.as_ref(),
                )
                .await?;
                return Ok(Some("Failed"));
            }
        };

        let mut updated = None;
        self.store.transcripts().update(&key, |entry| {
            entry.content = improved;
            entry.mode = TranscriptMode::Improved;
            updated = Some(entry.clone());
        });
        let Some(updated) = updated else {
            self.say(&query.chat_id, STALE_TRANSCRIPT, query.message_id.as_ref())
                .await?;
            return Ok(Some("Expired"));
        };

        let message = OutboundMessage::text(export::transcript_message(&updated))
            .with_buttons(commands::transcript_buttons(source, true));
        let reply_to = query.message_id.clone().unwrap_or_else(|| source.clone());
        let bot_message_id = self
            .replace_status(&query.chat_id, query.message_id.as_ref(), message, &reply_to)
            .await?;
        if query.message_id.as_ref() != Some(&bot_message_id) {
            let media = self
                .store
                .links()
                .resolve(&query.chat_id, &reply_to)
                .and_then(|link| link.media);
            self.store
                .links()
                .link(&query.chat_id, &bot_message_id, source, media);
        }
        Ok(Some("Improved"))
    }

    async fn confirm_tags(&self, query: &CallbackQuery) -> Result<Option<&'static str>> {
        let applied = match self
            .store
            .tags()
            .confirm(&query.sender_id, &self.settings.marker_tag)
        {
            Ok(applied) => applied,
            Err(e) => {
                tracing::debug!(%e, "confirm without a confirming workflow");
                return Ok(Some("Nothing to confirm"));
            }
        };
        let Some(entry) = self.store.transcripts().get(&applied.transcription_ref) else {
            self.say(&query.chat_id, STALE_TRANSCRIPT, query.message_id.as_ref())
                .await?;
            return Ok(Some("Expired"));
        };
        let note = export::transcript_note(&entry, applied.all_tags.clone());
        let confirm_message = query
            .message_id
            .clone()
            .or(applied.confirm_message_id.clone());
        match self.vault.save_note(&self.settings.vault_folder, &note).await {
            Ok(receipt) => {
                tracing::info!(path = %receipt.path, tags = ?applied.all_tags, "tagged transcript saved");
                let text = format!(
                    "💾 Saved to {} with {}",
                    receipt.path,
                    display_tags(&applied.all_tags)
                );
                self.replace_status(
                    &query.chat_id,
                    confirm_message.as_ref(),
                    OutboundMessage::text(text),
                    &applied.voice_message_id,
                )
                .await?;
                Ok(Some("Saved"))
            }
            Err(e) => {
                tracing::warn!(%e, "vault export with tags failed");
                self.say(
                    &query.chat_id,
                    format!("⚠️ Saving failed: {e}. Tap \"Save with tags\" to try again."),
                    confirm_message.as_ref(),
                )
                .await?;
                Ok(Some("Save failed"))
            }
        }
    }

    async fn cancel_tags(&self, query: &CallbackQuery) -> Result<Option<&'static str>> {
        if self.store.tags().abandon(&query.sender_id).is_err() {
            return Ok(Some("Nothing to cancel"));
        }
        if let Some(message_id) = query.message_id.as_ref() {
            if let Err(e) = self
                .channel
                .edit(
                    &query.chat_id,
                    message_id,
                    OutboundMessage::text("🏷 Tag selection cancelled."),
                )
                .await
            {
                tracing::warn!(%e, "clearing confirm buttons failed");
            }
        }
        Ok(Some("Cancelled"))
    }

    async fn cleanup_messages(
        &self,
        query: &CallbackQuery,
        token: &str,
    ) -> Result<Option<&'static str>> {
        let owned = self
            .store
            .cleanups()
            .get(&token.to_string())
            .is_some_and(|offer| offer.owner == query.sender_id);
        if !owned {
            return Ok(Some("This offer has expired"));
        }
        let Some(offer) = self.store.cleanups().take(&token.to_string()) else {
            return Ok(Some("This offer has expired"));
        };

        let mut failed = 0usize;
        for message_id in &offer.message_ids {
            if let Err(e) = self.channel.delete(&offer.chat_id, message_id).await {
                tracing::warn!(%e, message = %message_id, "cleanup delete failed");
                failed += 1;
            }
        }
        if let Some(offer_message) = query.message_id.as_ref() {
            if let Err(e) = self.channel.delete(&query.chat_id, offer_message).await {
                tracing::warn!(%e, "deleting cleanup offer failed");
            }
        }
        tracing::info!(
            deleted = offer.message_ids.len() - failed,
            failed,
            "collect messages cleaned up"
        );
        Ok(Some("Cleaned up"))
    }

    async fn keep_messages(
        &self,
        query: &CallbackQuery,
        token: &str,
    ) -> Result<Option<&'static str>> {
        self.store.cleanups().delete(&token.to_string());
        if let Some(offer_message) = query.message_id.as_ref() {
            if let Err(e) = self.channel.delete(&query.chat_id, offer_message).await {
                tracing::warn!(%e, "deleting cleanup offer failed");
            }
        }
        Ok(Some("Messages kept"))
    }

    // ---- commands ----

    async fn on_command(&self, command: InboundCommand) -> Result<()> {
        let parsed = Command::parse(&command.name);
        let owner = &command.sender_id;
        let abandoned_tags =
            parsed.abandons_tag_workflow() && self.store.tags().abandon(owner).is_ok();
        tracing::info!(command = %command.name, abandoned_tags, "command");

        match parsed {
            Command::Start | Command::Help => {
                self.say(&command.chat_id, HELP_TEXT, None).await?;
            }
            Command::Collect => self.start_collect(&command).await?,
            Command::Done => self.finish_collect(&command).await?,
            Command::Cancel => self.cancel_collect(&command, abandoned_tags).await?,
            Command::Status => {
                let session = self.store.collect().snapshot(owner);
                let workflow = self.store.tags().get(owner);
                let status =
                    commands::render_status(session.as_ref(), workflow.as_ref(), &self.store.stats());
                self.say(&command.chat_id, status, Some(&command.message_id))
                    .await?;
            }
            Command::Unknown(name) => {
                self.say(
                    &command.chat_id,
                    format!("Unknown command /{name}. Try /help."),
                    Some(&command.message_id),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn start_collect(&self, command: &InboundCommand) -> Result<()> {
        let owner = &command.sender_id;
        let text = match self.store.collect().start(owner, &command.chat_id) {
            Ok(_) => "📥 Collecting. Send text, voice, video, photos or documents.\n\
                      /done saves everything as one note, /cancel discards it."
                .to_string(),
            Err(SessionError::AlreadyActive) => {
                let items = self
                    .store
                    .collect()
                    .snapshot(owner)
                    .map(|session| session.items().len())
                    .unwrap_or(0);
                format!("Already collecting ({items} item(s)). /done to save or /cancel to stop.")
            }
            Err(e) => return Err(e.into()),
        };
        self.track(owner, &command.message_id, MessageRole::UserContent);
        self.notify(&command.chat_id, owner, text, Some(&command.message_id))
            .await?;
        Ok(())
    }

    async fn finish_collect(&self, command: &InboundCommand) -> Result<()> {
        let owner = &command.sender_id;
        let chat_id = &command.chat_id;
        self.track(owner, &command.message_id, MessageRole::UserContent);
        let finalized = match self.store.collect().finalize(owner) {
            Ok(finalized) => finalized,
            Err(SessionError::EmptySession) => {
                self.notify(
                    chat_id,
                    owner,
                    "Nothing collected yet. Send something first, or /cancel.",
                    Some(&command.message_id),
                )
                .await?;
                return Ok(());
            }
            Err(SessionError::NoActiveSession) => {
                self.say(
                    chat_id,
                    "No active collection. Start one with /collect.",
                    Some(&command.message_id),
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let title = self
            .make_title(&export::title_source(&finalized.items), "Collected note")
            .await;
        let note = export::collected_note(&finalized, title.clone(), &self.settings.marker_tag);
        match self.vault.save_note(&self.settings.vault_folder, &note).await {
            Ok(receipt) => {
                tracing::info!(
                    path = %receipt.path,
                    session_id = %finalized.id,
                    items = finalized.items.len(),
                    "collected note saved"
                );
                let result_id = self
                    .say(
                        chat_id,
                        format!(
                            "✅ Saved \"{title}\" ({} item(s)) to {}",
                            finalized.items.len(),
                            receipt.path
                        ),
                        None,
                    )
                    .await?;
                // The session is gone by now, so the result is tracked here.
                let mut tracked = finalized.tracked_messages;
                tracked.push(TrackedMessage {
                    message_id: result_id,
                    role: MessageRole::FinalResult,
                });
                self.offer_cleanup(chat_id, owner, tracked).await?;
            }
            Err(e) => {
                tracing::warn!(%e, session_id = %finalized.id, "collected note export failed");
                let body = note.body;
                match self.store.collect().restore(finalized) {
                    Ok(()) => {
                        self.notify(
                            chat_id,
                            owner,
                            format!(
                                "⚠️ Saving failed: {e}. Your collection is still open; send /done to retry."
                            ),
                            Some(&command.message_id),
                        )
                        .await?;
                    }
                    Err(_) => {
                        self.say(
                            chat_id,
                            format!(
                                "⚠️ Saving failed: {e}. A new collection was already started, \
                                 so here is the unsaved note:\n\n{body}"
                            ),
                            Some(&command.message_id),
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn cancel_collect(&self, command: &InboundCommand, abandoned_tags: bool) -> Result<()> {
        let owner = &command.sender_id;
        match self.store.collect().cancel(owner) {
            Ok(mut tracked) => {
                tracked.push(TrackedMessage {
                    message_id: command.message_id.clone(),
                    role: MessageRole::UserContent,
                });
                self.say(&command.chat_id, "🗑 Collection discarded.", None)
                    .await?;
                self.offer_cleanup(&command.chat_id, owner, tracked).await?;
            }
            Err(_) => {
                let text = if abandoned_tags {
                    "🏷 Tag selection cancelled."
                } else {
                    "Nothing to cancel."
                };
                self.say(&command.chat_id, text, Some(&command.message_id))
                    .await?;
            }
        }
        Ok(())
    }

    async fn offer_cleanup(
        &self,
        chat_id: &ChatId,
        owner: &SenderId,
        tracked: Vec<TrackedMessage>,
    ) -> Result<()> {
        if tracked.is_empty() {
            return Ok(());
        }
        let count = tracked.len();
        let token = self.store.offer_cleanup(CleanupOffer {
            chat_id: chat_id.clone(),
            owner: owner.clone(),
            message_ids: tracked.into_iter().map(|t| t.message_id).collect(),
        });
        self.channel
            .send(
                chat_id,
                OutboundMessage::text(format!(
                    "🧹 Remove the {count} message(s) from this collection?"
                ))
                .with_buttons(commands::cleanup_buttons(&token)),
            )
            .await?;
        Ok(())
    }

    // ---- messages and replies ----

    async fn on_message(&self, message: InboundMessage) -> Result<()> {
        if let MessageContent::Text { text } = &message.content {
            if self.store.tags().is_selecting(&message.sender_id) {
                return self.extract_tags(&message, text).await;
            }
        }
        if self.store.collect().is_active(&message.sender_id) {
            let staged = self.stage_item(&message)?;
            return self.complete_staged(&message, staged).await;
        }
        self.standalone(&message).await
    }

    async fn on_reply(&self, message: InboundMessage) -> Result<()> {
        let owner = message.sender_id.clone();
        if let MessageContent::Text { text } = &message.content {
            if self.store.tags().is_selecting(&owner) {
                return self.extract_tags(&message, text).await;
            }
        }
        let Some(replied) = message.reply_to.clone() else {
            return self.on_message(message).await;
        };
        let resolution = match reply::resolve_reply(
            &self.store,
            self.settings.reply_policy,
            &message.chat_id,
            &owner,
            &replied,
        ) {
            Ok(resolution) => resolution,
            Err(SessionError::NoActiveSession) => return self.on_message(message).await,
            Err(e) => return Err(e.into()),
        };
        let role = if replied.from_bot {
            MessageRole::BotResponse
        } else {
            MessageRole::UserContent
        };
        self.track(&owner, &replied.message_id, role);
        let staged = self.stage_item(&message)?;

        if resolution.session_started {
            self.notify(
                &message.chat_id,
                &owner,
                "📥 Started collecting with the message you replied to. \
                 Keep sending; /done saves, /cancel discards.",
                Some(&message.message_id),
            )
            .await?;
        }
        if let ReplyTarget::Attached { degraded: true, .. } = resolution.target {
            self.notify(
                &message.chat_id,
                &owner,
                "⌛ The replied-to transcript has expired, so it was added without text.",
                Some(&message.message_id),
            )
            .await?;
        }
        self.complete_staged(&message, staged).await
    }

    /// Add the message's own content to the live collect session.
    fn stage_item(&self, message: &InboundMessage) -> SessionResult<Staged> {
        let owner = &message.sender_id;
        let collect = self.store.collect();
        collect.track_message(owner, &message.message_id, MessageRole::UserContent)?;
        let source = message.message_id.clone();
        let item = match &message.content {
            MessageContent::Text { text } => CollectItem::text(text.clone(), source),
            MessageContent::Voice { media } | MessageContent::Video { media, .. } => {
                return self.stage_transcription(message, media, Some(owner));
            }
            MessageContent::Document { media, .. } if message.content.is_video_document() => {
                return self.stage_transcription(message, media, Some(owner));
            }
            MessageContent::Photo { media, caption } => {
                CollectItem::new(ItemKind::Photo, caption.clone(), source).with_media(media.clone())
            }
            MessageContent::Document { media, caption } => CollectItem::new(
                ItemKind::Document,
                caption.clone().or_else(|| media.file_name.clone()),
                source,
            )
            .with_media(media.clone()),
            MessageContent::Unsupported => return Ok(Staged::Skipped("unsupported content")),
        };
        let kind = item.kind;
        let index = collect.add_item(owner, item)?;
        Ok(Staged::Added {
            kind,
            total: index + 1,
        })
    }

    fn stage_transcription(
        &self,
        message: &InboundMessage,
        media: &MediaRef,
        owner: Option<&SenderId>,
    ) -> SessionResult<Staged> {
        if let Some(owner) = owner {
            self.store.collect().add_item(
                owner,
                CollectItem::pending(message.message_id.clone(), media.clone()),
            )?;
        }
        self.store.mark_pending(
            MessageKey::new(&message.chat_id, &message.message_id),
            PendingEntry {
                media: media.clone(),
                attached_session: owner.cloned(),
            },
        );
        Ok(Staged::Transcribe(media.clone()))
    }

    async fn complete_staged(&self, message: &InboundMessage, staged: Staged) -> Result<()> {
        match staged {
            Staged::Added { kind, total } => {
                let id = self
                    .say(
                        &message.chat_id,
                        format!("➕ Added {} ({total} so far)", kind.as_str()),
                        Some(&message.message_id),
                    )
                    .await?;
                self.track(&message.sender_id, &id, MessageRole::BotResponse);
                Ok(())
            }
            Staged::Transcribe(media) => self.transcribe(message, &media).await,
            Staged::Skipped(reason) => {
                tracing::debug!(reason, "message not collected");
                Ok(())
            }
        }
    }

    async fn standalone(&self, message: &InboundMessage) -> Result<()> {
        match &message.content {
            MessageContent::Text { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(());
                }
                self.deliver_transcript(message, None, text.to_string(), None)
                    .await
            }
            MessageContent::Voice { media } | MessageContent::Video { media, .. } => {
                self.stage_transcription(message, media, None)?;
                self.transcribe(message, media).await
            }
            MessageContent::Document { media, .. } if message.content.is_video_document() => {
                self.stage_transcription(message, media, None)?;
                self.transcribe(message, media).await
            }
            MessageContent::Photo { .. } => {
                self.say(
                    &message.chat_id,
                    "🖼 Photos are kept as part of a collection. Send /collect first.",
                    Some(&message.message_id),
                )
                .await?;
                Ok(())
            }
            MessageContent::Document { .. } | MessageContent::Unsupported => {
                tracing::debug!(kind = message.content.kind_name(), "ignored outside a collection");
                Ok(())
            }
        }
    }

    async fn run_transcription(&self, media: &MediaRef) -> SessionResult<String> {
        let bytes = self
            .channel
            .download(media)
            .await
            .map_err(|e| SessionError::ExternalService(format!("download failed: {e}")))?;
        let text = self
            .transcriber
            .transcribe(bytes, &media.upload_file_name())
            .await?;
        Ok(text.trim().to_string())
    }

    /// Transcribe a staged media message and route the result either into
    /// the collect session waiting on it or into a standalone reply.
    #[tracing::instrument(level = "info", skip_all, fields(message = %message.message_id))]
    async fn transcribe(&self, message: &InboundMessage, media: &MediaRef) -> Result<()> {
        let chat_id = &message.chat_id;
        let key = MessageKey::new(chat_id, &message.message_id);
        let status_id = match self
            .say(chat_id, "🎙 Transcribing…", Some(&message.message_id))
            .await
        {
            Ok(id) => {
                self.track(&message.sender_id, &id, MessageRole::BotNotification);
                Some(id)
            }
            Err(e) => {
                tracing::warn!(%e, "sending transcription status failed");
                None
            }
        };

        let outcome = self.run_transcription(media).await;
        // Re-read: the session may have ended or been attached meanwhile.
        let waiting = self
            .store
            .pending()
            .take(&key)
            .and_then(|entry| entry.attached_session)
            .unwrap_or_else(|| message.sender_id.clone());
        let payload = outcome.as_ref().ok().filter(|text| !text.is_empty()).cloned();

        let kind = ItemKind::for_media(media);
        match self
            .store
            .collect()
            .resolve_item(&waiting, &message.message_id, kind, payload.clone())
        {
            Ok(_) => {
                if let Some(text) = payload.as_deref() {
                    self.store.remember_transcript(
                        key,
                        TranscriptEntry {
                            title: local_title(text),
                            content: text.to_string(),
                            captured_at: message.received_at,
                            owner: message.sender_id.clone(),
                            mode: TranscriptMode::Raw,
                            source: transcript_source(media),
                        },
                    );
                }
                let status = match (&outcome, payload.is_some()) {
                    (_, true) => "✅ Transcribed and added to the collection.".to_string(),
                    (Ok(_), false) => "🤷 No speech recognized; added without text.".to_string(),
                    (Err(e), false) => format!("⚠️ Transcription failed ({e}); added without text."),
                };
                let status_id = self
                    .replace_status(
                        chat_id,
                        status_id.as_ref(),
                        OutboundMessage::text(status),
                        &message.message_id,
                    )
                    .await?;
                self.track(&waiting, &status_id, MessageRole::BotNotification);
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(%e, "no collect session waiting; replying standalone");
            }
        }

        match outcome {
            Ok(text) if !text.is_empty() => {
                self.deliver_transcript(message, Some(media), text, status_id.as_ref())
                    .await
            }
            Ok(_) => {
                self.replace_status(
                    chat_id,
                    status_id.as_ref(),
                    OutboundMessage::text("🤷 No speech recognized."),
                    &message.message_id,
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%e, "transcription failed");
                self.replace_status(
                    chat_id,
                    status_id.as_ref(),
                    OutboundMessage::text(format!(
                        "⚠️ Transcription failed: {e}. Send the message again to retry."
                    )),
                    &message.message_id,
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Cache the text, reply with the action buttons, and link the reply to
    /// the message it came from.
    async fn deliver_transcript(
        &self,
        message: &InboundMessage,
        media: Option<&MediaRef>,
        text: String,
        status_id: Option<&MessageId>,
    ) -> Result<()> {
        let fallback = if media.is_some() { "Voice note" } else { "Note" };
        let title = self.make_title(&text, fallback).await;
        let entry = TranscriptEntry {
            title,
            content: text,
            captured_at: message.received_at,
            owner: message.sender_id.clone(),
            mode: TranscriptMode::Raw,
            source: media.map(transcript_source).unwrap_or(TranscriptSource::Text),
        };
        let key = MessageKey::new(&message.chat_id, &message.message_id);
        self.store.remember_transcript(key, entry.clone());

        let reply = OutboundMessage::text(export::transcript_message(&entry))
            .with_buttons(commands::transcript_buttons(&message.message_id, false));
        let bot_message_id = self
            .replace_status(&message.chat_id, status_id, reply, &message.message_id)
            .await?;
        self.store.links().link(
            &message.chat_id,
            &bot_message_id,
            &message.message_id,
            media.cloned(),
        );
        tracing::info!(bot_message = %bot_message_id, "transcript delivered");
        Ok(())
    }

    async fn extract_tags(&self, message: &InboundMessage, utterance: &str) -> Result<()> {
        let owner = &message.sender_id;
        match self
            .store
            .tags()
            .extract_tags(owner, utterance, self.assistant.as_ref())
            .await
        {
            Ok(split) => {
                let all = merge_with_marker(&self.settings.marker_tag, &split);
                let mut text = format!("🏷 Save with {}?", display_tags(&all));
                if !split.new.is_empty() {
                    text.push_str(&format!("\nNew tags: {}", display_tags(&split.new)));
                }
                if split.is_empty() {
                    text.push_str("\nNo tags recognized, so only the default tag applies.");
                }
                let confirm_id = self
                    .channel
                    .send(
                        &message.chat_id,
                        OutboundMessage::text(text)
                            .replying_to(&message.message_id)
                            .with_buttons(commands::confirm_buttons()),
                    )
                    .await?;
                self.store.tags().set_confirm_message(owner, &confirm_id);
            }
            Err(SessionError::ExternalService(e)) => {
                self.say(
                    &message.chat_id,
                    format!("⚠️ Couldn't read those tags ({e}). Reply with your tags again."),
                    Some(&message.message_id),
                )
                .await?;
            }
            Err(e) => tracing::debug!(%e, "tag answer dropped"),
        }
        Ok(())
    }
}

fn transcript_source(media: &MediaRef) -> TranscriptSource {
    match media.kind {
        MediaKind::Voice | MediaKind::Audio => TranscriptSource::Voice,
        _ => TranscriptSource::Video,
    }
}

fn local_title(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Voice note");
    line.chars().take(LOCAL_TITLE_MAX_CHARS).collect()
}

fn tag_prompt(available: &[String], recommended: &TagSplit) -> String {
    let mut text = String::from("🏷 Which tags should this note get? Reply with them, separated by commas.");
    if !recommended.is_empty() {
        text.push_str(&format!("\n\nSuggested: {}", display_tags(&recommended.flat())));
    }
    if !available.is_empty() {
        let shown = &available[..available.len().min(TAG_LIST_LIMIT)];
        text.push_str(&format!("\n\nExisting: {}", display_tags(shown)));
        if available.len() > TAG_LIST_LIMIT {
            text.push_str(&format!(" (+{} more)", available.len() - TAG_LIST_LIMIT));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use tokio::sync::{Notify, mpsc};
    use vn_channels::{CallbackId, RepliedMessage};
    use vn_services::{Note, NoteReceipt, ServiceError};

    #[derive(Default)]
    struct FakeChannel {
        next_id: AtomicI64,
        sent: Mutex<Vec<(MessageId, OutboundMessage)>>,
        edits: Mutex<Vec<(MessageId, OutboundMessage)>>,
        deleted: Mutex<Vec<MessageId>>,
        answered: Mutex<Vec<Option<String>>>,
    }

    impl FakeChannel {
        fn sent_texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, m)| m.content.clone())
                .collect()
        }

        fn last_sent(&self) -> (MessageId, OutboundMessage) {
            self.sent.lock().expect("lock").last().cloned().expect("sent")
        }

        fn edit_texts(&self) -> Vec<String> {
            self.edits
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, m)| m.content.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _chat_id: &ChatId, message: OutboundMessage) -> Result<MessageId> {
            let id = MessageId::from(1000 + self.next_id.fetch_add(1, Ordering::SeqCst));
            self.sent
                .lock()
                .expect("lock")
                .push((id.clone(), message));
            Ok(id)
        }

        async fn edit(
            &self,
            _chat_id: &ChatId,
            message_id: &MessageId,
            message: OutboundMessage,
        ) -> Result<()> {
            self.edits
                .lock()
                .expect("lock")
                .push((message_id.clone(), message));
            Ok(())
        }

        async fn delete(&self, _chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
            self.deleted.lock().expect("lock").push(message_id.clone());
            Ok(())
        }

        async fn answer_callback(&self, _id: &CallbackId, text: Option<&str>) -> Result<()> {
            self.answered
                .lock()
                .expect("lock")
                .push(text.map(str::to_string));
            Ok(())
        }

        async fn download(&self, media: &MediaRef) -> Result<Bytes> {
            Ok(Bytes::from(media.file_id.clone()))
        }
    }

    /// Transcribes by looking up the downloaded bytes (the file id).
    #[derive(Default)]
    struct FakeTranscriber {
        scripts: Mutex<HashMap<String, String>>,
        hold: Option<Arc<Notify>>,
    }

    impl FakeTranscriber {
        fn script(&self, file_id: &str, text: &str) {
            self.scripts
                .lock()
                .expect("lock")
                .insert(file_id.to_string(), text.to_string());
        }
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio: Bytes, _file_name: &str) -> vn_services::Result<String> {
            if let Some(hold) = self.hold.as_ref() {
                hold.notified().await;
            }
            let file_id = String::from_utf8_lossy(&audio).to_string();
            self.scripts
                .lock()
                .expect("lock")
                .get(&file_id)
                .cloned()
                .ok_or_else(|| ServiceError::Upstream(format!("no audio for {file_id}")))
        }
    }

    #[derive(Default)]
    struct FakeAssistant {
        classification: Mutex<serde_json::Value>,
    }

    #[async_trait]
    impl TextAssistant for FakeAssistant {
        async fn title(&self, text: &str) -> vn_services::Result<String> {
            Ok(local_title(text))
        }

        async fn improve(&self, text: &str) -> vn_services::Result<String> {
            Ok(text.to_uppercase())
        }

        async fn recommend_tags(
            &self,
            _text: &str,
            _available: &[String],
        ) -> vn_services::Result<serde_json::Value> {
            Ok(serde_json::json!({"existing": ["errands"], "new": []}))
        }

        async fn classify_tags(
            &self,
            _utterance: &str,
            _available: &[String],
        ) -> vn_services::Result<serde_json::Value> {
            Ok(self.classification.lock().expect("lock").clone())
        }
    }

    #[derive(Default)]
    struct FakeVault {
        saved: Mutex<Vec<Note>>,
        fail: AtomicBool,
    }

    impl FakeVault {
        fn saved(&self) -> Vec<Note> {
            self.saved.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl NoteVault for FakeVault {
        async fn list_tags(&self) -> vn_services::Result<Vec<String>> {
            Ok(vec!["errands".to_string(), "work".to_string()])
        }

        async fn save_note(&self, folder: &str, note: &Note) -> vn_services::Result<NoteReceipt> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ServiceError::Http("vault unreachable".into()));
            }
            let mut saved = self.saved.lock().expect("lock");
            saved.push(note.clone());
            Ok(NoteReceipt {
                path: format!("{folder}/note-{}.md", saved.len()),
            })
        }
    }

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        channel: Arc<FakeChannel>,
        transcriber: Arc<FakeTranscriber>,
        assistant: Arc<FakeAssistant>,
        vault: Arc<FakeVault>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_transcriber(FakeTranscriber::default())
        }

        fn with_transcriber(transcriber: FakeTranscriber) -> Self {
            let channel = Arc::new(FakeChannel::default());
            let transcriber = Arc::new(transcriber);
            let assistant = Arc::new(FakeAssistant::default());
            let vault = Arc::new(FakeVault::default());
            let orchestrator = Arc::new(SessionOrchestrator::new(
                Arc::new(SessionStore::default()),
                channel.clone(),
                transcriber.clone(),
                assistant.clone(),
                vault.clone(),
                OrchestratorSettings::default(),
            ));
            Self {
                orchestrator,
                channel,
                transcriber,
                assistant,
                vault,
            }
        }

        fn store(&self) -> &SessionStore {
            self.orchestrator.store()
        }

        async fn handle(&self, event: InboundEvent) {
            self.orchestrator.handle(event).await.expect("handle");
        }
    }

    fn chat() -> ChatId {
        ChatId::from(42)
    }

    fn owner() -> SenderId {
        SenderId::from(7)
    }

    fn inbound(id: i64, content: MessageContent, reply_to: Option<RepliedMessage>) -> InboundEvent {
        InboundEvent::from_message(InboundMessage {
            message_id: MessageId::from(id),
            chat_id: chat(),
            sender_id: owner(),
            content,
            reply_to,
            received_at: Utc::now(),
        })
    }

    fn text(id: i64, body: &str) -> InboundEvent {
        inbound(id, MessageContent::text(body), None)
    }

    fn voice(id: i64, file_id: &str) -> InboundEvent {
        inbound(
            id,
            MessageContent::Voice {
                media: MediaRef::new(MediaKind::Voice, file_id),
            },
            None,
        )
    }

    fn callback(id: &str, data: &str, message_id: Option<&MessageId>) -> InboundEvent {
        InboundEvent::Callback(CallbackQuery {
            callback_id: CallbackId::from(id),
            chat_id: chat(),
            sender_id: owner(),
            message_id: message_id.cloned(),
            data: data.to_string(),
            received_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn collect_text_and_voice_exports_in_order() {
        let h = Harness::new();
        h.transcriber.script("v2", "call mom");

        h.handle(text(1, "/collect")).await;
        h.handle(text(2, "buy milk")).await;
        h.handle(voice(3, "v2")).await;
        h.handle(text(4, "/done")).await;

        let saved = h.vault.saved();
        assert_eq!(saved.len(), 1);
        let body = &saved[0].body;
        let milk = body.find("buy milk").expect("text item");
        let mom = body.find("call mom").expect("voice item");
        assert!(milk < mom);
        assert_eq!(saved[0].tags, vec!["voxnote"]);
        assert!(!h.store().collect().is_active(&owner()));

        let (_, offer) = h.channel.last_sent();
        assert!(offer.content.starts_with("🧹"));
        assert_eq!(offer.buttons[0].len(), 2);
    }

    #[tokio::test]
    async fn done_while_transcribing_exports_placeholder_then_replies_standalone() {
        let hold = Arc::new(Notify::new());
        let h = Harness::with_transcriber(FakeTranscriber {
            hold: Some(hold.clone()),
            ..FakeTranscriber::default()
        });
        h.transcriber.script("v2", "call mom");

        h.handle(text(1, "/collect")).await;
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.handle(voice(2, "v2")).await });
        for _ in 0..100 {
            if h.store().pending().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store().pending().len(), 1);

        h.handle(text(3, "/done")).await;
        assert!(h.vault.saved()[0].body.contains(export::STILL_TRANSCRIBING));

        hold.notify_one();
        task.await.expect("join").expect("voice handled");
        assert!(h.store().pending().is_empty());
        let cached = h
            .store()
            .transcripts()
            .get(&MessageKey::new(&chat(), &MessageId::from(2)))
            .expect("standalone transcript cached");
        assert_eq!(cached.content, "call mom");
        assert!(h.channel.edit_texts().iter().any(|t| t.contains("call mom")));
    }

    #[tokio::test]
    async fn reply_to_expired_transcript_collects_without_payload() {
        let h = Harness::new();
        h.store().links().link(
            &chat(),
            &MessageId::from(11),
            &MessageId::from(10),
            Some(MediaRef::new(MediaKind::Voice, "gone")),
        );
        let replied = RepliedMessage {
            message_id: MessageId::from(11),
            from_bot: true,
            content: MessageContent::text("📝 old"),
        };
        h.handle(inbound(12, MessageContent::text("and this"), Some(replied)))
            .await;

        let session = h.store().collect().snapshot(&owner()).expect("auto-started");
        assert_eq!(session.items().len(), 2);
        assert_eq!(session.items()[0].payload, None);
        assert_eq!(session.items()[0].kind, ItemKind::Voice);
        assert_eq!(session.items()[1].payload.as_deref(), Some("and this"));
        assert!(h.channel.sent_texts().iter().any(|t| t.contains("expired")));

        h.handle(text(13, "/done")).await;
        assert!(h.vault.saved()[0].body.contains(export::NO_TRANSCRIPT));
    }

    #[tokio::test]
    async fn malformed_tag_classification_still_confirms_with_marker() {
        let h = Harness::new();
        h.transcriber.script("v1", "pick up groceries");
        *h.assistant.classification.lock().expect("lock") =
            serde_json::json!({"existing": "not-an-array"});

        h.handle(voice(1, "v1")).await;
        let transcript_message = h.store().links().len();
        assert_eq!(transcript_message, 1);
        let status_id = h.channel.sent.lock().expect("lock")[0].0.clone();

        h.handle(callback("cb1", "tags:1", Some(&status_id))).await;
        assert!(h.store().tags().is_selecting(&owner()));
        assert!(h.channel.last_sent().1.content.contains("#errands"));

        h.handle(text(2, "whatever")).await;
        assert_eq!(
            h.store().tags().get(&owner()).map(|w| w.phase_name()),
            Some("confirming")
        );
        let (confirm_id, confirm) = h.channel.last_sent();
        assert_eq!(confirm.buttons, commands::confirm_buttons());

        h.handle(callback("cb2", "tag_confirm", Some(&confirm_id))).await;
        let saved = h.vault.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tags, vec!["voxnote"]);
        assert_eq!(saved[0].body, "pick up groceries");
        assert!(h.store().tags().is_empty());
    }

    #[tokio::test]
    async fn duplicate_callbacks_export_once() {
        let h = Harness::new();
        h.handle(text(1, "remember the keys")).await;
        let (bot_id, _) = h.channel.last_sent();

        h.handle(callback("cb1", "save:1", Some(&bot_id))).await;
        h.handle(callback("cb1", "save:1", Some(&bot_id))).await;
        assert_eq!(h.vault.saved().len(), 1);

        // A double tap gets a fresh callback id but the same button.
        h.handle(callback("cb2", "save:1", Some(&bot_id))).await;
        assert_eq!(h.vault.saved().len(), 1);
        let answered = h.channel.answered.lock().expect("lock").clone();
        assert_eq!(
            answered,
            vec![
                Some("Saved".to_string()),
                None,
                Some("Already done".to_string())
            ],
            "every press is answered so the client stops spinning"
        );
    }

    #[tokio::test]
    async fn failed_save_can_be_retried_from_the_same_button() {
        let h = Harness::new();
        h.handle(text(1, "remember the keys")).await;
        let (bot_id, _) = h.channel.last_sent();

        h.vault.fail.store(true, Ordering::SeqCst);
        h.handle(callback("cb1", "save:1", Some(&bot_id))).await;
        assert!(h.vault.saved().is_empty());
        assert!(h.channel.sent_texts().iter().any(|t| t.contains("Saving failed")));

        h.vault.fail.store(false, Ordering::SeqCst);
        h.handle(callback("cb2", "save:1", Some(&bot_id))).await;
        assert_eq!(h.vault.saved().len(), 1);
    }

    #[tokio::test]
    async fn improve_rewrites_cache_and_message() {
        let h = Harness::new();
        h.handle(text(1, "call the plumber")).await;
        let (bot_id, _) = h.channel.last_sent();

        h.handle(callback("cb1", "improve:1", Some(&bot_id))).await;
        let entry = h
            .store()
            .transcripts()
            .get(&MessageKey::new(&chat(), &MessageId::from(1)))
            .expect("cached");
        assert_eq!(entry.mode, TranscriptMode::Improved);
        assert_eq!(entry.content, "CALL THE PLUMBER");
        let (edited_id, edited) = h.channel.edits.lock().expect("lock")[0].clone();
        assert_eq!(edited_id, bot_id);
        assert_eq!(edited.buttons.len(), 1, "improve button removed");
    }

    #[tokio::test]
    async fn empty_done_keeps_session_and_cancel_offers_cleanup() {
        let h = Harness::new();
        h.handle(text(1, "/collect")).await;
        h.handle(text(2, "/done")).await;
        assert!(h.store().collect().is_active(&owner()));
        assert!(h.vault.saved().is_empty());

        h.handle(text(3, "/cancel")).await;
        assert!(!h.store().collect().is_active(&owner()));
        let (offer_id, offer) = h.channel.last_sent();
        let CallbackAction::Cleanup(token) = CallbackAction::parse(&offer.buttons[0][0].data)
        else {
            panic!("expected cleanup button");
        };

        h.handle(callback("cb1", &format!("cleanup:{token}"), Some(&offer_id)))
            .await;
        let deleted = h.channel.deleted.lock().expect("lock").clone();
        for id in ["1", "2", "3"] {
            assert!(deleted.contains(&MessageId::from(id)), "deleted user message {id}");
        }
        assert!(deleted.contains(&offer_id));
        assert!(h.store().cleanups().is_empty());
    }

    #[tokio::test]
    async fn failed_collect_export_reopens_session() {
        let h = Harness::new();
        h.handle(text(1, "/collect")).await;
        h.handle(text(2, "buy milk")).await;
        h.vault.fail.store(true, Ordering::SeqCst);
        h.handle(text(3, "/done")).await;

        let session = h.store().collect().snapshot(&owner()).expect("restored");
        assert_eq!(session.items().len(), 1);

        h.vault.fail.store(false, Ordering::SeqCst);
        h.handle(text(4, "/done")).await;
        assert_eq!(h.vault.saved().len(), 1);
    }

    #[tokio::test]
    async fn commands_abandon_tag_selection_except_status() {
        let h = Harness::new();
        h.handle(text(1, "note")).await;
        let (bot_id, _) = h.channel.last_sent();
        h.handle(callback("cb1", "tags:1", Some(&bot_id))).await;
        assert!(h.store().tags().is_selecting(&owner()));

        h.handle(text(2, "/status")).await;
        assert!(h.store().tags().is_selecting(&owner()));
        assert!(h.channel.last_sent().1.content.contains("waiting for your tag choice"));

        h.handle(text(3, "/collect")).await;
        assert!(h.store().tags().is_empty());
        assert!(h.store().collect().is_active(&owner()));
    }

    #[tokio::test]
    async fn failed_transcription_reports_and_cleans_pending() {
        let h = Harness::new();
        h.handle(voice(1, "unknown")).await;
        assert!(h.store().pending().is_empty());
        assert!(h
            .channel
            .edit_texts()
            .iter()
            .any(|t| t.contains("Transcription failed")));
        assert!(h.store().links().is_empty());
    }

    #[tokio::test]
    async fn done_offers_cleanup_including_the_saved_confirmation() {
        let h = Harness::new();
        h.handle(text(1, "/collect")).await;
        h.handle(text(2, "buy milk")).await;
        h.handle(text(3, "/done")).await;

        let sent = h.channel.sent.lock().expect("lock").clone();
        let (result_id, _) = sent
            .iter()
            .find(|(_, m)| m.content.starts_with("✅"))
            .cloned()
            .expect("saved confirmation");
        let (offer_id, offer) = h.channel.last_sent();
        let CallbackAction::Cleanup(token) = CallbackAction::parse(&offer.buttons[0][0].data)
        else {
            panic!("expected cleanup button");
        };
        let pending_offer = h.store().cleanups().get(&token).expect("offer stored");
        assert_eq!(pending_offer.message_ids.last(), Some(&result_id));

        h.handle(callback("cb1", &format!("cleanup:{token}"), Some(&offer_id)))
            .await;
        let deleted = h.channel.deleted.lock().expect("lock").clone();
        for id in ["1", "2", "3"] {
            assert!(deleted.contains(&MessageId::from(id)), "deleted user message {id}");
        }
        for (bot_id, _) in &sent {
            if bot_id != &offer_id {
                assert!(deleted.contains(bot_id), "deleted bot message {bot_id}");
            }
        }
        assert!(deleted.contains(&offer_id));
    }

    #[tokio::test]
    async fn reply_to_voice_still_transcribing_resolves_placeholder_in_place() {
        let hold = Arc::new(Notify::new());
        let h = Harness::with_transcriber(FakeTranscriber {
            hold: Some(hold.clone()),
            ..FakeTranscriber::default()
        });
        h.transcriber.script("v1", "call mom");

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.handle(voice(1, "v1")).await });
        for _ in 0..100 {
            if h.store().pending().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store().pending().len(), 1);

        let replied = RepliedMessage {
            message_id: MessageId::from(1),
            from_bot: false,
            content: MessageContent::Voice {
                media: MediaRef::new(MediaKind::Voice, "v1"),
            },
        };
        h.handle(inbound(2, MessageContent::text("buy milk"), Some(replied)))
            .await;
        let session = h.store().collect().snapshot(&owner()).expect("auto-started");
        assert_eq!(session.items()[0].kind, ItemKind::Pending);
        assert_eq!(session.items()[1].payload.as_deref(), Some("buy milk"));

        hold.notify_one();
        task.await.expect("join").expect("voice handled");
        let session = h.store().collect().snapshot(&owner()).expect("still collecting");
        assert_eq!(session.items()[0].kind, ItemKind::Voice);
        assert_eq!(session.items()[0].payload.as_deref(), Some("call mom"));
        assert_eq!(session.pending_count(), 0);

        h.handle(text(3, "/done")).await;
        let saved = h.vault.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].body, "**🎙 Voice**\ncall mom\n\nbuy milk");
    }
}
