use crate::error::{Result, ServiceError};
use crate::traits::{Note, NoteReceipt, NoteVault};
use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

/// REST note vault: `GET {base}/tags`, `POST {base}/notes`.
#[derive(Clone)]
pub struct HttpNoteVault {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpNoteVault {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ServiceError::InvalidInput(format!("vault base url {base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::InvalidInput(format!("vault endpoint {path}: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct SaveNoteRequest<'a> {
    folder: &'a str,
    title: &'a str,
    body: &'a str,
    tags: &'a [String],
    metadata: &'a serde_json::Value,
}

#[async_trait]
impl NoteVault for HttpNoteVault {
    #[tracing::instrument(level = "info", skip_all)]
    async fn list_tags(&self) -> Result<Vec<String>> {
        let response = self
            .authorize(self.http.get(self.endpoint("tags")?))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "vault list tags status={status} body={body}"
            )));
        }
        let value: serde_json::Value = serde_json::from_str(&body)?;
        Ok(parse_tag_listing(&value))
    }

    #[tracing::instrument(level = "info", skip_all, fields(folder = %folder, title = %note.title))]
    async fn save_note(&self, folder: &str, note: &Note) -> Result<NoteReceipt> {
        let request = SaveNoteRequest {
            folder,
            title: &note.title,
            body: &note.body,
            tags: &note.tags,
            metadata: &note.metadata,
        };
        let response = self
            .authorize(self.http.post(self.endpoint("notes")?))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "vault save note status={status} body={body}"
            )));
        }
        let value: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        Ok(parse_receipt(&value, folder, &note.title))
    }
}

/// Accepts either a bare array or `{"tags": [...]}`; non-string entries are
/// skipped.
fn parse_tag_listing(value: &serde_json::Value) -> Vec<String> {
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => match map.get("tags") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| item.as_str())
        .map(|tag| tag.trim().trim_start_matches('#').to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn parse_receipt(value: &serde_json::Value, folder: &str, title: &str) -> NoteReceipt {
    let path = value
        .get("path")
        .and_then(|p| p.as_str())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("{folder}/{title}.md"));
    NoteReceipt { path }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_listing_accepts_both_shapes() {
        assert_eq!(
            parse_tag_listing(&serde_json::json!(["#work", "home", 3, " "])),
            vec!["work".to_string(), "home".to_string()]
        );
        assert_eq!(
            parse_tag_listing(&serde_json::json!({"tags": ["ideas"]})),
            vec!["ideas".to_string()]
        );
        assert!(parse_tag_listing(&serde_json::json!({"tags": "ideas"})).is_empty());
    }

    #[test]
    fn receipt_falls_back_to_folder_and_title() {
        let receipt = parse_receipt(&serde_json::Value::Null, "Inbox", "Groceries");
        assert_eq!(receipt.path, "Inbox/Groceries.md");
        let receipt = parse_receipt(&serde_json::json!({"path": "Inbox/x.md"}), "Inbox", "y");
        assert_eq!(receipt.path, "Inbox/x.md");
    }

    #[test]
    fn base_url_gains_trailing_slash_so_join_appends() {
        let vault = HttpNoteVault::new("https://vault.local/api/v1", Some(" ".to_string()))
            .expect("vault");
        assert_eq!(
            vault.endpoint("notes").expect("endpoint").as_str(),
            "https://vault.local/api/v1/notes"
        );
        assert!(vault.api_key.is_none());
    }
}
