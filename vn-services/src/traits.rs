use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Speech-to-text over raw media bytes. `file_name` carries the
    /// extension the service uses to sniff the container format.
    async fn transcribe(&self, audio: Bytes, file_name: &str) -> Result<String>;
}

/// Title, readability and tag-classification calls.
///
/// Tag calls return the service's raw structured output: callers own the
/// policy for malformed shapes.
#[async_trait]
pub trait TextAssistant: Send + Sync {
    async fn title(&self, text: &str) -> Result<String>;

    async fn improve(&self, text: &str) -> Result<String>;

    async fn recommend_tags(&self, text: &str, available: &[String]) -> Result<serde_json::Value>;

    async fn classify_tags(
        &self,
        utterance: &str,
        available: &[String],
    ) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteReceipt {
    pub path: String,
}

#[async_trait]
pub trait NoteVault: Send + Sync {
    async fn list_tags(&self) -> Result<Vec<String>>;

    async fn save_note(&self, folder: &str, note: &Note) -> Result<NoteReceipt>;
}
