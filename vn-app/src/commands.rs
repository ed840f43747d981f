//! Chat commands and inline-button payloads.

use crate::collect::CollectSession;
use crate::session::StoreStats;
use crate::tags::{TagWorkflow, display_tags};
use vn_channels::{InlineButton, MessageId};

pub const HELP_TEXT: &str = "Send me a voice message, video or text and I'll transcribe it \
and offer to save it to your vault.\n\n\
/collect  start gathering several messages into one note\n\
/done     save everything collected so far\n\
/cancel   stop collecting (or drop a tag selection)\n\
/status   show what is in progress\n\
/help     this message\n\n\
Tip: reply to any message to start collecting with it.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Collect,
    Done,
    Cancel,
    Status,
    Unknown(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        match name.trim().trim_start_matches('/').to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "collect" => Self::Collect,
            "done" => Self::Done,
            "cancel" => Self::Cancel,
            "status" => Self::Status,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Every command except the read-only ones interrupts tag selection.
    pub fn abandons_tag_workflow(&self) -> bool {
        !matches!(self, Self::Status | Self::Help)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Save(MessageId),
    SelectTags(MessageId),
    Improve(MessageId),
    ConfirmTags,
    CancelTags,
    Cleanup(String),
    Keep(String),
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Self {
        match data.trim() {
            "tag_confirm" => return Self::ConfirmTags,
            "tag_cancel" => return Self::CancelTags,
            _ => {}
        }
        let Some((verb, arg)) = data.trim().split_once(':') else {
            return Self::Unknown;
        };
        let arg = arg.trim();
        if arg.is_empty() {
            return Self::Unknown;
        }
        match verb {
            "save" => Self::Save(MessageId::from(arg)),
            "tags" => Self::SelectTags(MessageId::from(arg)),
            "improve" => Self::Improve(MessageId::from(arg)),
            "cleanup" => Self::Cleanup(arg.to_string()),
            "keep" => Self::Keep(arg.to_string()),
            _ => Self::Unknown,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Save(id) => format!("save:{id}"),
            Self::SelectTags(id) => format!("tags:{id}"),
            Self::Improve(id) => format!("improve:{id}"),
            Self::ConfirmTags => "tag_confirm".to_string(),
            Self::CancelTags => "tag_cancel".to_string(),
            Self::Cleanup(token) => format!("cleanup:{token}"),
            Self::Keep(token) => format!("keep:{token}"),
            Self::Unknown => String::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::SelectTags(_) => "select_tags",
            Self::Improve(_) => "improve",
            Self::ConfirmTags => "confirm_tags",
            Self::CancelTags => "cancel_tags",
            Self::Cleanup(_) => "cleanup",
            Self::Keep(_) => "keep",
            Self::Unknown => "unknown",
        }
    }

    /// Actions whose effect must happen once per button, even when the user
    /// taps it twice and the platform issues two callback ids.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Save(_) | Self::ConfirmTags | Self::Cleanup(_))
    }
}

fn button(label: &str, action: CallbackAction) -> InlineButton {
    InlineButton::new(label, action.encode())
}

pub fn transcript_buttons(source: &MessageId, improved: bool) -> Vec<Vec<InlineButton>> {
    let mut rows = vec![vec![
        button("💾 Save", CallbackAction::Save(source.clone())),
        button("🏷 Save with tags", CallbackAction::SelectTags(source.clone())),
    ]];
    if !improved {
        rows.push(vec![button(
            "✨ Improve readability",
            CallbackAction::Improve(source.clone()),
        )]);
    }
    rows
}

pub fn confirm_buttons() -> Vec<Vec<InlineButton>> {
    vec![vec![
        button("✅ Confirm", CallbackAction::ConfirmTags),
        button("✖ Cancel", CallbackAction::CancelTags),
    ]]
}

pub fn cleanup_buttons(token: &str) -> Vec<Vec<InlineButton>> {
    vec![vec![
        button("🧹 Clean up chat", CallbackAction::Cleanup(token.to_string())),
        button("Keep messages", CallbackAction::Keep(token.to_string())),
    ]]
}

pub fn render_status(
    collect: Option<&CollectSession>,
    tags: Option<&TagWorkflow>,
    stats: &StoreStats,
) -> String {
    let mut lines = Vec::new();
    match collect {
        Some(session) => {
            let counts = session
                .counts_by_kind()
                .iter()
                .map(|(kind, count)| format!("{count} {}", kind.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!(
                "collecting: {} item(s) since {}{}",
                session.items().len(),
                session.started_at.format("%H:%M UTC"),
                if counts.is_empty() {
                    String::new()
                } else {
                    format!(" ({counts})")
                }
            ));
            let pending = session.pending_count();
            if pending > 0 {
                lines.push(format!("still transcribing: {pending}"));
            }
            lines.push(format!(
                "messages to clean up when done: {}",
                session.tracked_messages().len()
            ));
        }
        None => lines.push("collecting: no".to_string()),
    }
    match tags {
        Some(TagWorkflow::Selecting(_)) => {
            lines.push("tags: waiting for your tag choice".to_string())
        }
        Some(TagWorkflow::Confirming(confirmation)) => lines.push(format!(
            "tags: waiting for confirmation of {}",
            if confirmation.selected_flat.is_empty() {
                "no extra tags".to_string()
            } else {
                display_tags(&confirmation.selected_flat)
            }
        )),
        None => lines.push("tags: idle".to_string()),
    }
    lines.push(format!(
        "cached transcripts={} transcribing={}",
        stats.transcripts, stats.pending
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{CollectItem, CollectRegistry, MessageRole};
    use vn_channels::{ChatId, MediaKind, MediaRef, SenderId};

    #[test]
    fn parses_known_and_unknown_commands() {
        assert_eq!(Command::parse("done"), Command::Done);
        assert_eq!(Command::parse("/Collect"), Command::Collect);
        assert_eq!(Command::parse("frob"), Command::Unknown("frob".into()));
        assert!(Command::Collect.abandons_tag_workflow());
        assert!(Command::Unknown("x".into()).abandons_tag_workflow());
        assert!(!Command::Status.abandons_tag_workflow());
        assert!(!Command::Help.abandons_tag_workflow());
    }

    #[test]
    fn callback_payloads_round_trip_through_buttons() {
        let rows = transcript_buttons(&MessageId::from(10), false);
        let data: Vec<CallbackAction> = rows
            .iter()
            .flatten()
            .map(|b| CallbackAction::parse(&b.data))
            .collect();
        assert_eq!(
            data,
            vec![
                CallbackAction::Save(MessageId::from(10)),
                CallbackAction::SelectTags(MessageId::from(10)),
                CallbackAction::Improve(MessageId::from(10)),
            ]
        );
        assert_eq!(transcript_buttons(&MessageId::from(10), true).len(), 1);
        assert!(rows.iter().flatten().all(|b| b.data.len() <= 64));
    }

    #[test]
    fn malformed_callback_data_is_unknown() {
        assert_eq!(CallbackAction::parse("save:"), CallbackAction::Unknown);
        assert_eq!(CallbackAction::parse("launch:1"), CallbackAction::Unknown);
        assert_eq!(CallbackAction::parse(""), CallbackAction::Unknown);
        assert_eq!(CallbackAction::parse("tag_confirm"), CallbackAction::ConfirmTags);
        assert_eq!(
            CallbackAction::parse("cleanup:abc"),
            CallbackAction::Cleanup("abc".into())
        );
    }

    #[test]
    fn status_lists_counts_and_tag_phase() {
        let registry = CollectRegistry::new();
        let owner = SenderId::from(7);
        registry.start(&owner, &ChatId::from(1)).expect("start");
        registry
            .add_item(&owner, CollectItem::text("a", MessageId::from(1)))
            .expect("add");
        registry
            .track_message(&owner, &MessageId::from(1), MessageRole::UserContent)
            .expect("track");
        registry
            .add_item(
                &owner,
                CollectItem::pending(MessageId::from(2), MediaRef::new(MediaKind::Voice, "v")),
            )
            .expect("add pending");
        let session = registry.snapshot(&owner);

        let status = render_status(session.as_ref(), None, &StoreStats::default());
        assert!(status.contains("collecting: 2 item(s)"));
        assert!(status.contains("1 text"));
        assert!(status.contains("still transcribing: 1"));
        assert!(status.contains("messages to clean up when done: 1"));
        assert!(status.contains("tags: idle"));
        assert!(render_status(None, None, &StoreStats::default()).starts_with("collecting: no"));
    }
}
