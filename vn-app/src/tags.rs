//! Two-phase tag selection: the user is shown existing and recommended tags,
//! answers in free form, confirms the classified result, and the note is
//! exported with those tags.

use crate::error::{SessionError, SessionResult};
use crate::session::MessageKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use vn_channels::{MessageId, SenderId};
use vn_services::TextAssistant;

/// Tags split into ones the vault already knows and ones it does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagSplit {
    pub existing: Vec<String>,
    pub new: Vec<String>,
}

impl TagSplit {
    /// Read `{"existing": [..], "new": [..]}` from a classifier reply.
    /// Missing or non-array fields are treated as empty; non-string entries
    /// are skipped.
    pub fn from_classifier(value: &Value) -> Self {
        let existing = dedupe(string_array(value, "existing"));
        let new = dedupe(string_array(value, "new"))
            .into_iter()
            .filter(|tag| !contains_tag(&existing, tag))
            .collect();
        Self { existing, new }
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty() && self.new.is_empty()
    }

    pub fn flat(&self) -> Vec<String> {
        self.existing.iter().chain(self.new.iter()).cloned().collect()
    }
}

fn string_array(value: &Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_tag)
                .collect()
        })
        .unwrap_or_default()
}

fn contains_tag(tags: &[String], tag: &str) -> bool {
    tags.iter().any(|known| known.eq_ignore_ascii_case(tag))
}

fn dedupe(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !contains_tag(&out, &tag) {
            out.push(tag);
        }
    }
    out
}

/// Strip leading `#`s and join words with underscores. Blank input yields
/// `None`.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let stripped = raw.trim().trim_start_matches('#');
    let joined = stripped.split_whitespace().collect::<Vec<_>>().join("_");
    (!joined.is_empty()).then_some(joined)
}

pub fn display_tag(tag: &str) -> String {
    format!("#{tag}")
}

pub fn display_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| display_tag(tag))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Marker first, then the split, each tag once.
pub fn merge_with_marker(marker: &str, split: &TagSplit) -> Vec<String> {
    let mut all = Vec::new();
    all.extend(normalize_tag(marker));
    all.extend(split.flat());
    dedupe(all)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSelection {
    pub id: Uuid,
    pub voice_message_id: MessageId,
    pub transcription_ref: MessageKey,
    pub list_message_id: MessageId,
    pub bot_message_id: Option<MessageId>,
    pub available_tags: Vec<String>,
    pub recommended: TagSplit,
    pub started_at: DateTime<Utc>,
}

impl TagSelection {
    pub fn new(
        transcription_ref: MessageKey,
        list_message_id: MessageId,
        bot_message_id: Option<MessageId>,
        available_tags: Vec<String>,
        recommended: TagSplit,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            voice_message_id: transcription_ref.message_id.clone(),
            transcription_ref,
            list_message_id,
            bot_message_id,
            available_tags,
            recommended,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagConfirmation {
    pub selection: TagSelection,
    pub selected_flat: Vec<String>,
    pub selected: TagSplit,
    pub confirm_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagWorkflow {
    Selecting(TagSelection),
    Confirming(TagConfirmation),
}

impl TagWorkflow {
    pub fn phase_name(&self) -> &'static str {
        match self {
            Self::Selecting(_) => "selecting",
            Self::Confirming(_) => "confirming",
        }
    }

    #[cfg(test)]
    pub fn selection(&self) -> &TagSelection {
        match self {
            Self::Selecting(selection) => selection,
            Self::Confirming(confirmation) => &confirmation.selection,
        }
    }
}

/// Result of a confirmed workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTags {
    pub all_tags: Vec<String>,
    pub transcription_ref: MessageKey,
    pub voice_message_id: MessageId,
    pub confirm_message_id: Option<MessageId>,
}

#[derive(Default)]
pub struct TagWorkflows {
    workflows: DashMap<SenderId, TagWorkflow>,
}

impl TagWorkflows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start selecting. Any incomplete workflow for the owner is replaced.
    pub fn begin_selection(&self, owner: &SenderId, selection: TagSelection) {
        let voice = selection.voice_message_id.clone();
        if let Some(previous) = self
            .workflows
            .insert(owner.clone(), TagWorkflow::Selecting(selection))
        {
            tracing::debug!(
                owner = %owner,
                replaced_phase = previous.phase_name(),
                "tag workflow replaced by a new selection"
            );
        }
        tracing::info!(owner = %owner, voice_message_id = %voice, "tag selection started");
    }

    pub fn get(&self, owner: &SenderId) -> Option<TagWorkflow> {
        self.workflows.get(owner).map(|w| w.value().clone())
    }

    pub fn is_selecting(&self, owner: &SenderId) -> bool {
        matches!(
            self.workflows.get(owner).as_deref(),
            Some(TagWorkflow::Selecting(_))
        )
    }

    /// Classify a free-form answer and move to confirming.
    ///
    /// The selection is re-read after the classifier returns; if it was
    /// replaced or abandoned meanwhile, the result is discarded.
    pub async fn extract_tags(
        &self,
        owner: &SenderId,
        utterance: &str,
        classifier: &dyn TextAssistant,
    ) -> SessionResult<TagSplit> {
        let selection = match self.workflows.get(owner).as_deref() {
            Some(TagWorkflow::Selecting(selection)) => selection.clone(),
            Some(TagWorkflow::Confirming(_)) => {
                return Err(SessionError::InvalidTransition {
                    from: "confirming",
                    operation: "extract_tags",
                });
            }
            None => return Err(SessionError::NoActiveSession),
        };

        let raw = classifier
            .classify_tags(utterance, &selection.available_tags)
            .await?;
        let split = TagSplit::from_classifier(&raw);

        let mut current = self
            .workflows
            .get_mut(owner)
            .ok_or_else(|| SessionError::StaleReference("tag selection was abandoned".into()))?;
        let TagWorkflow::Selecting(live) = &*current else {
            return Err(SessionError::StaleReference(
                "tag selection already moved on".into(),
            ));
        };
        if live.id != selection.id {
            return Err(SessionError::StaleReference(
                "tag selection was replaced".into(),
            ));
        }
        *current = TagWorkflow::Confirming(TagConfirmation {
            selection,
            selected_flat: split.flat(),
            selected: split.clone(),
            confirm_message_id: None,
        });
        tracing::info!(
            owner = %owner,
            existing = split.existing.len(),
            new = split.new.len(),
            "tags extracted"
        );
        Ok(split)
    }

    /// Remember the message carrying the confirm buttons.
    pub fn set_confirm_message(&self, owner: &SenderId, message_id: &MessageId) -> bool {
        match self.workflows.get_mut(owner).as_deref_mut() {
            Some(TagWorkflow::Confirming(confirmation)) => {
                confirmation.confirm_message_id = Some(message_id.clone());
                true
            }
            _ => false,
        }
    }

    pub fn confirm(&self, owner: &SenderId, marker_tag: &str) -> SessionResult<AppliedTags> {
        let removed = self
            .workflows
            .remove_if(owner, |_, workflow| matches!(workflow, TagWorkflow::Confirming(_)));
        match removed {
            Some((_, TagWorkflow::Confirming(confirmation))) => {
                let all_tags = merge_with_marker(marker_tag, &confirmation.selected);
                tracing::info!(owner = %owner, tags = ?all_tags, "tags confirmed");
                Ok(AppliedTags {
                    all_tags,
                    transcription_ref: confirmation.selection.transcription_ref,
                    voice_message_id: confirmation.selection.voice_message_id,
                    confirm_message_id: confirmation.confirm_message_id,
                })
            }
            _ if self.workflows.contains_key(owner) => Err(SessionError::InvalidTransition {
                from: "selecting",
                operation: "confirm",
            }),
            _ => Err(SessionError::NoActiveSession),
        }
    }

    /// Drop the workflow from either live phase.
    pub fn abandon(&self, owner: &SenderId) -> SessionResult<TagWorkflow> {
        let (_, workflow) = self
            .workflows
            .remove(owner)
            .ok_or(SessionError::NoActiveSession)?;
        tracing::info!(owner = %owner, phase = workflow.phase_name(), "tag workflow abandoned");
        Ok(workflow)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.workflows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use vn_channels::ChatId;
    use vn_services::ServiceError;

    struct ScriptedClassifier {
        reply: Option<Value>,
        interfere: Option<(Arc<TagWorkflows>, SenderId)>,
    }

    impl ScriptedClassifier {
        fn replying(reply: Value) -> Self {
            Self {
                reply: Some(reply),
                interfere: None,
            }
        }
    }

    #[async_trait]
    impl TextAssistant for ScriptedClassifier {
        async fn title(&self, text: &str) -> vn_services::Result<String> {
            Ok(text.to_string())
        }

        async fn improve(&self, text: &str) -> vn_services::Result<String> {
            Ok(text.to_string())
        }

        async fn recommend_tags(&self, _: &str, _: &[String]) -> vn_services::Result<Value> {
            Ok(Value::Null)
        }

        async fn classify_tags(&self, _: &str, _: &[String]) -> vn_services::Result<Value> {
            if let Some((workflows, owner)) = &self.interfere {
                workflows.begin_selection(owner, selection("99"));
            }
            self.reply
                .clone()
                .ok_or_else(|| ServiceError::Upstream("classifier offline".into()))
        }
    }

    fn owner() -> SenderId {
        SenderId::from(7)
    }

    fn selection(voice: &str) -> TagSelection {
        TagSelection::new(
            MessageKey::new(&ChatId::from(42), &MessageId::from(voice)),
            MessageId::from(500),
            Some(MessageId::from(400)),
            vec!["work".into(), "Groceries".into()],
            TagSplit::default(),
        )
    }

    #[test]
    fn classifier_output_is_parsed_leniently() {
        let split = TagSplit::from_classifier(&serde_json::json!({"existing": "not-an-array"}));
        assert_eq!(split, TagSplit::default());

        let split = TagSplit::from_classifier(&serde_json::json!({
            "existing": ["#work", 3, "Work", "  "],
            "new": ["road trip", "WORK"]
        }));
        assert_eq!(split.existing, vec!["work"]);
        assert_eq!(split.new, vec!["road_trip"]);
        assert!(TagSplit::from_classifier(&Value::Null).is_empty());
    }

    #[test]
    fn marker_comes_first_and_is_not_repeated() {
        let split = TagSplit {
            existing: vec!["VoxNote".into(), "work".into()],
            new: vec!["ideas".into()],
        };
        assert_eq!(
            merge_with_marker("#voxnote", &split),
            vec!["voxnote", "work", "ideas"]
        );
        assert_eq!(display_tags(&["a".into(), "b_c".into()]), "#a #b_c");
        assert_eq!(normalize_tag("## deep  work "), Some("deep_work".into()));
        assert_eq!(normalize_tag("#"), None);
    }

    #[tokio::test]
    async fn malformed_classifier_reply_still_reaches_confirming() {
        let workflows = TagWorkflows::new();
        workflows.begin_selection(&owner(), selection("10"));
        let classifier =
            ScriptedClassifier::replying(serde_json::json!({"existing": "not-an-array"}));

        let split = workflows
            .extract_tags(&owner(), "whatever", &classifier)
            .await
            .expect("extract");
        assert_eq!(split, TagSplit::default());
        assert_eq!(
            workflows.get(&owner()).map(|w| w.phase_name()),
            Some("confirming")
        );
    }

    #[tokio::test]
    async fn classifier_failure_stays_selecting() {
        let workflows = TagWorkflows::new();
        workflows.begin_selection(&owner(), selection("10"));
        let classifier = ScriptedClassifier {
            reply: None,
            interfere: None,
        };
        let err = workflows
            .extract_tags(&owner(), "work", &classifier)
            .await
            .expect_err("classifier failed");
        assert!(matches!(err, SessionError::ExternalService(_)));
        assert!(workflows.is_selecting(&owner()));
    }

    #[tokio::test]
    async fn selection_replaced_during_classification_is_stale() {
        let workflows = Arc::new(TagWorkflows::new());
        workflows.begin_selection(&owner(), selection("10"));
        let classifier = ScriptedClassifier {
            reply: Some(serde_json::json!({"existing": ["work"], "new": []})),
            interfere: Some((workflows.clone(), owner())),
        };
        let err = workflows
            .extract_tags(&owner(), "work", &classifier)
            .await
            .expect_err("replaced");
        assert!(matches!(err, SessionError::StaleReference(_)));
        let current = workflows.get(&owner()).expect("workflow");
        assert_eq!(current.phase_name(), "selecting");
        assert_eq!(current.selection().voice_message_id, MessageId::from("99"));
    }

    #[tokio::test]
    async fn confirm_only_from_confirming() {
        let workflows = TagWorkflows::new();
        assert_eq!(
            workflows.confirm(&owner(), "voxnote"),
            Err(SessionError::NoActiveSession)
        );
        workflows.begin_selection(&owner(), selection("10"));
        assert!(matches!(
            workflows.confirm(&owner(), "voxnote"),
            Err(SessionError::InvalidTransition { from: "selecting", .. })
        ));

        let classifier = ScriptedClassifier::replying(
            serde_json::json!({"existing": ["work"], "new": ["side project"]}),
        );
        workflows
            .extract_tags(&owner(), "work and side project", &classifier)
            .await
            .expect("extract");
        assert!(workflows.set_confirm_message(&owner(), &MessageId::from(600)));
        let applied = workflows.confirm(&owner(), "voxnote").expect("confirm");
        assert_eq!(applied.all_tags, vec!["voxnote", "work", "side_project"]);
        assert_eq!(applied.voice_message_id, MessageId::from(10));
        assert_eq!(applied.confirm_message_id, Some(MessageId::from(600)));
        assert!(workflows.is_empty());
    }

    #[tokio::test]
    async fn abandon_from_either_phase() {
        let workflows = TagWorkflows::new();
        workflows.begin_selection(&owner(), selection("10"));
        assert_eq!(
            workflows.abandon(&owner()).map(|w| w.phase_name()),
            Ok("selecting")
        );
        assert_eq!(
            workflows.abandon(&owner()).map(|w| w.phase_name()),
            Err(SessionError::NoActiveSession)
        );
        workflows.begin_selection(&owner(), selection("11"));
        let classifier = ScriptedClassifier::replying(serde_json::json!({"new": ["x"]}));
        workflows
            .extract_tags(&owner(), "x", &classifier)
            .await
            .expect("extract");
        assert_eq!(
            workflows.abandon(&owner()).map(|w| w.phase_name()),
            Ok("confirming")
        );
    }
}
