//! Rendering transcripts and collected items into chat text and vault notes.

use crate::collect::{CollectItem, FinalizedSession, ItemKind};
use crate::session::{TranscriptEntry, TranscriptMode};
use crate::tags::{TagSplit, merge_with_marker};
use vn_services::Note;

pub const NO_TRANSCRIPT: &str = "_No transcript available._";
pub const STILL_TRANSCRIBING: &str = "_Transcription still in progress._";

/// Chat text for a standalone transcript reply.
pub fn transcript_message(entry: &TranscriptEntry) -> String {
    let marker = match entry.mode {
        TranscriptMode::Raw => "📝",
        TranscriptMode::Improved => "✨",
    };
    format!("{marker} {}\n\n{}", entry.title, entry.content)
}

pub fn transcript_note(entry: &TranscriptEntry, tags: Vec<String>) -> Note {
    Note {
        title: entry.title.clone(),
        body: entry.content.clone(),
        tags,
        metadata: serde_json::json!({
            "source": entry.source,
            "mode": entry.mode,
            "captured_at": entry.captured_at.to_rfc3339(),
        }),
    }
}

/// Tags for a save without selection: just the marker.
pub fn marker_tags(marker: &str) -> Vec<String> {
    merge_with_marker(marker, &TagSplit::default())
}

fn item_body(item: &CollectItem) -> String {
    match (&item.kind, item.payload.as_deref().map(str::trim)) {
        (ItemKind::Pending, _) => STILL_TRANSCRIBING.to_string(),
        (_, Some(text)) if !text.is_empty() => text.to_string(),
        (ItemKind::Photo, _) => "_Photo_".to_string(),
        (ItemKind::Document, _) => "_Document_".to_string(),
        _ => NO_TRANSCRIPT.to_string(),
    }
}

fn item_heading(item: &CollectItem) -> Option<&'static str> {
    match item.kind {
        ItemKind::Text => None,
        ItemKind::Voice => Some("🎙 Voice"),
        ItemKind::Video => Some("🎬 Video"),
        ItemKind::Photo => Some("🖼 Photo"),
        ItemKind::Document => Some("📎 Document"),
        ItemKind::Pending => Some("⏳ Pending"),
    }
}

/// Note body: items in collection order, separated by blank lines.
pub fn render_collected(items: &[CollectItem]) -> String {
    items
        .iter()
        .map(|item| match item_heading(item) {
            Some(heading) => format!("**{heading}**\n{}", item_body(item)),
            None => item_body(item),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Plain text the title generator sees for a collected note.
pub fn title_source(items: &[CollectItem]) -> String {
    items
        .iter()
        .filter_map(|item| item.payload.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn collected_note(finalized: &FinalizedSession, title: String, marker: &str) -> Note {
    let counts: serde_json::Map<String, serde_json::Value> = finalized
        .counts_by_kind
        .iter()
        .map(|(kind, count)| (kind.as_str().to_string(), serde_json::json!(count)))
        .collect();
    Note {
        title,
        body: render_collected(&finalized.items),
        tags: marker_tags(marker),
        metadata: serde_json::json!({
            "source": "collect",
            "session_id": finalized.id.to_string(),
            "started_at": finalized.started_at.to_rfc3339(),
            "items": finalized.items.len(),
            "counts": counts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::CollectRegistry;
    use crate::session::TranscriptSource;
    use chrono::Utc;
    use vn_channels::{ChatId, MediaKind, MediaRef, MessageId, SenderId};

    #[test]
    fn collected_body_keeps_order_and_marks_gaps() {
        let items = vec![
            CollectItem::text("buy milk", MessageId::from(1)),
            CollectItem::new(ItemKind::Voice, Some("call mom".into()), MessageId::from(2)),
            CollectItem::new(ItemKind::Voice, None, MessageId::from(3)),
            CollectItem::pending(MessageId::from(4), MediaRef::new(MediaKind::Voice, "v")),
        ];
        let body = render_collected(&items);
        let buy = body.find("buy milk").expect("text");
        let call = body.find("call mom").expect("voice");
        assert!(buy < call);
        assert!(body.contains(NO_TRANSCRIPT));
        assert!(body.ends_with(STILL_TRANSCRIBING));
        assert_eq!(title_source(&items), "buy milk\ncall mom");
    }

    #[test]
    fn collected_note_carries_marker_and_counts() {
        let registry = CollectRegistry::new();
        let owner = SenderId::from(7);
        registry.start(&owner, &ChatId::from(1)).expect("start");
        registry
            .add_item(&owner, CollectItem::text("a", MessageId::from(1)))
            .expect("add");
        let finalized = registry.finalize(&owner).expect("finalize");

        let note = collected_note(&finalized, "Groceries".into(), "#voxnote");
        assert_eq!(note.tags, vec!["voxnote"]);
        assert_eq!(note.metadata["counts"]["text"], 1);
        assert_eq!(note.body, "a");
    }

    #[test]
    fn transcript_message_marks_improved_text() {
        let mut entry = TranscriptEntry {
            title: "Errands".into(),
            content: "buy milk".into(),
            captured_at: Utc::now(),
            owner: SenderId::from(7),
            mode: TranscriptMode::Raw,
            source: TranscriptSource::Voice,
        };
        assert_eq!(transcript_message(&entry), "📝 Errands\n\nbuy milk");
        entry.mode = TranscriptMode::Improved;
        assert!(transcript_message(&entry).starts_with("✨"));
        let note = transcript_note(&entry, marker_tags("voxnote"));
        assert_eq!(note.metadata["mode"], "improved");
    }
}
