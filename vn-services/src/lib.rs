//! External collaborators consumed by the VoxNote session engine.
//!
//! Each collaborator is a trait so the engine can be driven by fakes in
//! tests; the concrete adapters here talk HTTP.

mod assistant;
mod error;
mod traits;
mod vault;
mod whisper;

pub use assistant::{LlmTextAssistant, OfflineTextAssistant, parse_json_reply};
pub use error::{Result, ServiceError};
pub use traits::{Note, NoteReceipt, NoteVault, TextAssistant, Transcriber};
pub use vault::HttpNoteVault;
pub use whisper::WhisperTranscriber;
