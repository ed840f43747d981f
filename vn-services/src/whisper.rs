use crate::error::{Result, ServiceError};
use crate::traits::Transcriber;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

const OPENAI_TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
// Long voice notes routinely take tens of seconds upstream.
const TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct WhisperTranscriber {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TRANSCRIPTION_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            endpoint: OPENAI_TRANSCRIPTIONS_URL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    #[tracing::instrument(level = "info", skip_all, fields(file_name = %file_name, bytes = audio.len()))]
    async fn transcribe(&self, audio: Bytes, file_name: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(ServiceError::InvalidInput("empty audio payload".to_string()));
        }
        let part = reqwest::multipart::Part::bytes(audio.to_vec()).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "transcription status={status} body={body}"
            )));
        }
        let parsed: TranscriptionResponse = serde_json::from_str(&body)?;
        Ok(parsed.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_audio_is_rejected_before_any_request() {
        let transcriber = WhisperTranscriber::new("sk-test")
            .expect("client")
            .with_endpoint("http://127.0.0.1:9/unreachable");
        let err = transcriber
            .transcribe(Bytes::new(), "a.ogg")
            .await
            .expect_err("empty payload");
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[test]
    fn response_text_field_defaults_to_empty() {
        let parsed: TranscriptionResponse = serde_json::from_str("{}").expect("parse");
        assert_eq!(parsed.text, "");
    }
}
