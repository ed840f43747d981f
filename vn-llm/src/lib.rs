//! BYO-key LLM client for VoxNote.
//!
//! Pure HTTP client used for titles, readability rewrites and tag
//! classification. Non-streaming only.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
