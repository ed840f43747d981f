//! VoxNote configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use crate::reply::ReplyPolicy;
use crate::session::StoreTtls;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One day.
const MAX_CACHE_TTL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct VoxNoteConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Model used for titles, readability rewrites and tag classification.
    pub model: String,
    #[serde(default = "default_marker_tag")]
    pub marker_tag: String,
    #[serde(default = "default_vault_folder")]
    pub vault_folder: String,
    #[serde(default)]
    pub transcription_model: Option<String>,
}

fn default_marker_tag() -> String {
    "voxnote".to_string()
}

fn default_vault_folder() -> String {
    "Inbox".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    /// Open a collect session when the user replies to a message.
    #[serde(default = "default_true")]
    pub auto_start_on_reply: bool,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            auto_start_on_reply: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_transcript_ttl_seconds")]
    pub transcript_ttl_seconds: u64,
    #[serde(default = "default_pending_ttl_seconds")]
    pub pending_ttl_seconds: u64,
    #[serde(default = "default_cleanup_ttl_seconds")]
    pub cleanup_ttl_seconds: u64,
}

fn default_transcript_ttl_seconds() -> u64 {
    30 * 60
}

fn default_pending_ttl_seconds() -> u64 {
    10 * 60
}

fn default_cleanup_ttl_seconds() -> u64 {
    30 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            transcript_ttl_seconds: default_transcript_ttl_seconds(),
            pending_ttl_seconds: default_pending_ttl_seconds(),
            cleanup_ttl_seconds: default_cleanup_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn ttls(&self) -> StoreTtls {
        StoreTtls {
            transcript: Duration::from_secs(self.transcript_ttl_seconds),
            pending: Duration::from_secs(self.pending_ttl_seconds),
            cleanup: Duration::from_secs(self.cleanup_ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Telegram user ids allowed to talk to the bot. Empty allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl SecurityConfig {
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allowed_users.is_empty()
            || self
                .allowed_users
                .iter()
                .any(|allowed| allowed.trim() == sender_id)
    }
}

impl VoxNoteConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: VoxNoteConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("VOXNOTE_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
            self.telegram.enabled = true;
        }
        if let Some(v) = var("VAULT_BASE_URL") {
            self.vault.base_url = v;
        }
        if let Some(v) = var("VAULT_API_KEY") {
            self.vault.api_key = Some(v);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.telegram.enabled && self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.vault.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("vault.base_url is required"));
        }
        for (name, seconds) in [
            ("transcript_ttl_seconds", self.cache.transcript_ttl_seconds),
            ("pending_ttl_seconds", self.cache.pending_ttl_seconds),
            ("cleanup_ttl_seconds", self.cache.cleanup_ttl_seconds),
        ] {
            if seconds == 0 || seconds > MAX_CACHE_TTL_SECONDS {
                return Err(anyhow::anyhow!(
                    "cache.{name} must be between 1 and {MAX_CACHE_TTL_SECONDS}"
                ));
            }
        }
        Ok(())
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.general.model.to_ascii_lowercase();
        if model.starts_with("claude-") {
            return self
                .keys
                .anthropic_api_key
                .clone()
                .filter(|s| !s.is_empty());
        }
        self.keys.openai_api_key.clone().filter(|s| !s.is_empty())
    }

    pub fn reply_policy(&self) -> ReplyPolicy {
        ReplyPolicy {
            auto_collect: self.collect.auto_start_on_reply,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".voxnote").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[general]
model = "gpt-4o-mini"

[vault]
base_url = "http://localhost:27124"
"#;

    fn parse(contents: &str) -> anyhow::Result<VoxNoteConfig> {
        let mut cfg: VoxNoteConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(MINIMAL).expect("config");
        assert_eq!(cfg.general.marker_tag, "voxnote");
        assert_eq!(cfg.general.vault_folder, "Inbox");
        assert!(cfg.collect.auto_start_on_reply);
        assert_eq!(cfg.cache.ttls(), StoreTtls::default());
        assert!(cfg.security.is_allowed("anyone"));
        assert!(!cfg.telegram.enabled);
    }

    #[test]
    fn env_overrides_enable_telegram_and_pick_keys() {
        let mut cfg = parse(MINIMAL).expect("config");
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("VOXNOTE_MODEL", "claude-3-5-haiku-latest"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "  "),
        ]);
        cfg.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert!(cfg.telegram.enabled);
        assert_eq!(cfg.telegram.bot_token, "123:abc");
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-ant"));
        assert_eq!(cfg.keys.openai_api_key, None, "blank values are ignored");
    }

    #[test]
    fn validation_rejects_missing_vault_and_token() {
        let err = parse("[general]\nmodel = \"gpt-4o\"\n").expect_err("no vault");
        assert!(err.to_string().contains("vault.base_url"));

        let with_telegram = format!("{MINIMAL}\n[telegram]\nenabled = true\n");
        let err = parse(&with_telegram).expect_err("no token");
        assert!(err.to_string().contains("telegram.bot_token"));
    }

    #[test]
    fn validation_bounds_cache_ttls() {
        let zero = format!("{MINIMAL}\n[cache]\ncleanup_ttl_seconds = 0\n");
        let err = parse(&zero).expect_err("zero ttl");
        assert!(err.to_string().contains("cache.cleanup_ttl_seconds"));

        let huge = format!("{MINIMAL}\n[cache]\npending_ttl_seconds = 9223372036854775807\n");
        let err = parse(&huge).expect_err("unbounded ttl");
        assert!(err.to_string().contains("cache.pending_ttl_seconds"));

        let day = format!("{MINIMAL}\n[cache]\ntranscript_ttl_seconds = 86400\n");
        assert!(parse(&day).is_ok());
    }

    #[test]
    fn allowlist_and_reply_policy() {
        let cfg = parse(&format!(
            "{MINIMAL}\n[collect]\nauto_start_on_reply = false\n\n[security]\nallowed_users = [\"42\"]\n"
        ))
        .expect("config");
        assert!(cfg.security.is_allowed("42"));
        assert!(!cfg.security.is_allowed("43"));
        assert!(!cfg.reply_policy().auto_collect);
    }
}
