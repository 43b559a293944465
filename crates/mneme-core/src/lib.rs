//! Shared types for the conversational memory core.
//!
//! Nothing in this crate performs I/O. Storage lives in `mneme-store`,
//! provider clients in `mneme-llm`, and the turn pipeline in `mneme-engine`.

pub mod errors;
pub mod messages;
pub mod provider;

pub use errors::ProviderError;
pub use messages::{ChatTurn, Message, Role, SourceTag};
pub use provider::{Embedder, FragmentStream, GenerateOptions, TextStreamer};
