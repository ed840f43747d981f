use crate::error::Result;
use crate::traits::TextAssistant;
use async_trait::async_trait;
use vn_llm::LlmClient;

const TITLE_MAX_CHARS: usize = 60;

const TITLE_PROMPT: &str = "You write titles for personal notes. Reply with a single short title \
(at most 8 words) in the language of the note. No quotes, no trailing punctuation.";

const IMPROVE_PROMPT: &str = "You clean up dictated notes. Fix punctuation, casing and obvious \
speech-to-text mistakes, split into paragraphs where natural, and keep the author's wording and \
language. Reply with the cleaned note only.";

const RECOMMEND_PROMPT: &str = "You suggest tags for a personal note. You are given the note and \
the tags that already exist in the vault. Reply with JSON only, shaped as \
{\"existing\": [..], \"new\": [..]}: up to 5 existing tags that fit, and at most 3 new tags when \
nothing existing fits. Tags are lowercase, without '#'.";

const CLASSIFY_PROMPT: &str = "The user was shown a list of existing tags and answered with the \
tags they want. Map the answer to JSON only, shaped as {\"existing\": [..], \"new\": [..]}: \
`existing` holds tags from the provided list (use the list's spelling), `new` holds every other \
tag the user asked for. Tags are without '#'.";

/// Parse a model reply that should be JSON, tolerating code fences and
/// surrounding prose. Unparseable replies become `Null`.
pub fn parse_json_reply(reply: &str) -> serde_json::Value {
    let trimmed = reply.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    if let Ok(value) = serde_json::from_str(unfenced) {
        return value;
    }
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&unfenced[start..=end]).unwrap_or(serde_json::Value::Null)
        }
        _ => serde_json::Value::Null,
    }
}

fn render_tag_request(text: &str, available: &[String]) -> String {
    format!(
        "Existing tags: {}\n\n---\n{}",
        if available.is_empty() {
            "(none)".to_string()
        } else {
            available.join(", ")
        },
        text
    )
}

#[derive(Clone)]
pub struct LlmTextAssistant {
    llm: LlmClient,
}

impl LlmTextAssistant {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TextAssistant for LlmTextAssistant {
    async fn title(&self, text: &str) -> Result<String> {
        let title = self.llm.complete(TITLE_PROMPT, text).await?;
        let title = title.trim().trim_matches('"').trim();
        if title.is_empty() {
            return Ok(first_line_title(text));
        }
        Ok(truncate_chars(title, TITLE_MAX_CHARS))
    }

    async fn improve(&self, text: &str) -> Result<String> {
        Ok(self.llm.complete(IMPROVE_PROMPT, text).await?)
    }

    async fn recommend_tags(&self, text: &str, available: &[String]) -> Result<serde_json::Value> {
        let reply = self
            .llm
            .complete(RECOMMEND_PROMPT, &render_tag_request(text, available))
            .await?;
        Ok(parse_json_reply(&reply))
    }

    async fn classify_tags(
        &self,
        utterance: &str,
        available: &[String],
    ) -> Result<serde_json::Value> {
        let reply = self
            .llm
            .complete(CLASSIFY_PROMPT, &render_tag_request(utterance, available))
            .await?;
        Ok(parse_json_reply(&reply))
    }
}

/// Keyless fallback: first-line titles and literal tag matching.
#[derive(Debug, Clone, Default)]
pub struct OfflineTextAssistant;

#[async_trait]
impl TextAssistant for OfflineTextAssistant {
    async fn title(&self, text: &str) -> Result<String> {
        Ok(first_line_title(text))
    }

    async fn improve(&self, text: &str) -> Result<String> {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut chars = collapsed.chars();
        let mut out = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        if !out.is_empty() && !out.ends_with(['.', '!', '?']) {
            out.push('.');
        }
        Ok(out)
    }

    async fn recommend_tags(&self, text: &str, available: &[String]) -> Result<serde_json::Value> {
        let lowered = text.to_lowercase();
        let existing: Vec<&String> = available
            .iter()
            .filter(|tag| {
                let needle = tag.to_lowercase().replace('_', " ");
                !needle.is_empty() && lowered.contains(&needle)
            })
            .collect();
        Ok(serde_json::json!({ "existing": existing, "new": [] }))
    }

    async fn classify_tags(
        &self,
        utterance: &str,
        available: &[String],
    ) -> Result<serde_json::Value> {
        let pieces: Vec<&str> = if utterance.contains([',', '\n', ';']) {
            utterance.split([',', '\n', ';']).collect()
        } else {
            utterance.split_whitespace().collect()
        };
        let mut existing = Vec::new();
        let mut new = Vec::new();
        for piece in pieces {
            let tag = piece.trim().trim_start_matches('#').trim();
            if tag.is_empty() {
                continue;
            }
            match available
                .iter()
                .find(|known| known.eq_ignore_ascii_case(tag))
            {
                Some(known) => existing.push(known.clone()),
                None => new.push(tag.to_string()),
            }
        }
        Ok(serde_json::json!({ "existing": existing, "new": new }))
    }
}

fn first_line_title(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Untitled note");
    truncate_chars(line.trim_end_matches(['.', '!', '?', ',']), TITLE_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out = out.trim_end().to_string();
    out.push('…');
    out
}
