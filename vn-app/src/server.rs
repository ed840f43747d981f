//! VoxNote runtime wiring.
//!
//! Builds the collaborators from config, starts the Telegram poller and runs
//! the gateway until a shutdown signal arrives.

use crate::config::VoxNoteConfig;
use crate::gateway::Gateway;
use crate::orchestrator::{OrchestratorSettings, SessionOrchestrator};
use crate::session::SessionStore;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vn_channels::{ChannelAdapter, ChatId, OutboundMessage, TelegramAdapter};
use vn_llm::LlmClient;
use vn_services::{
    HttpNoteVault, LlmTextAssistant, OfflineTextAssistant, TextAssistant, WhisperTranscriber,
};

const INBOUND_QUEUE_DEPTH: usize = 256;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = VoxNoteConfig::load_with_path(config_path).await?;
    tracing::info!(config_path = %path.display(), model = %cfg.general.model, "config loaded");

    if !cfg.telegram.enabled {
        return Err(anyhow::anyhow!(
            "telegram is disabled; set telegram.enabled = true or TELEGRAM_BOT_TOKEN"
        ));
    }
    let channel: Arc<dyn ChannelAdapter> = Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token)?);

    let openai_key = cfg
        .keys
        .openai_api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key is required for transcription"))?;
    let mut transcriber = WhisperTranscriber::new(openai_key)?;
    if let Some(model) = cfg.general.transcription_model.as_deref() {
        transcriber = transcriber.with_model(model);
    }

    let assistant: Arc<dyn TextAssistant> = match cfg.api_key_for_model() {
        Some(key) => Arc::new(LlmTextAssistant::new(LlmClient::new(
            &key,
            &cfg.general.model,
        ))),
        None => {
            tracing::warn!(
                model = %cfg.general.model,
                "no API key for model; titles fall back to local text and tagging is unavailable"
            );
            Arc::new(OfflineTextAssistant)
        }
    };

    let vault = HttpNoteVault::new(&cfg.vault.base_url, cfg.vault.api_key.clone())?;
    let store = Arc::new(SessionStore::new(cfg.cache.ttls()));
    tracing::info!(ttls = ?store.ttls(), "session store ready");
    let orchestrator = Arc::new(SessionOrchestrator::new(
        store,
        channel.clone(),
        Arc::new(transcriber),
        assistant,
        Arc::new(vault),
        OrchestratorSettings {
            marker_tag: cfg.general.marker_tag.clone(),
            vault_folder: cfg.general.vault_folder.clone(),
            reply_policy: cfg.reply_policy(),
        },
    ));

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    channel.start(tx).await?;
    tracing::info!(channel = channel.channel_id(), "channel started");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(cfg.security.clone(), orchestrator, rx));
    let handle = gateway.start(shutdown.clone());

    shutdown_signal(shutdown).await;
    if let Err(e) = handle.await {
        tracing::error!(%e, "gateway task failed");
    }
    tracing::info!("voxnote stopped");
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = VoxNoteConfig::load_with_path(config_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        llm_key_present = cfg.api_key_for_model().is_some(),
        transcription_key_present = cfg.keys.openai_api_key.is_some(),
        telegram_enabled = cfg.telegram.enabled,
        vault_base_url = %cfg.vault.base_url,
        vault_folder = %cfg.general.vault_folder,
        auto_start_on_reply = cfg.collect.auto_start_on_reply,
        allowed_users = cfg.security.allowed_users.len(),
        config_path = %path.display(),
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, chat: &str, message: &str) -> Result<()> {
    let cfg = VoxNoteConfig::load(config_path).await?;
    let adapter = TelegramAdapter::new(&cfg.telegram.bot_token)?;
    let sent = adapter
        .send(&ChatId::from(chat), OutboundMessage::text(message))
        .await?;
    tracing::info!(chat = %chat, message_id = %sent, "message sent");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; shutting down");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; shutting down");
        }
    }
    shutdown.cancel();
}
