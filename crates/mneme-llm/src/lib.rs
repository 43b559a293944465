//! # mneme-llm
//!
//! Clients for a local Ollama server plus the plumbing shared by every
//! consumer of a fragment stream:
//!
//! - [`OllamaEmbedder`]: `POST /api/embeddings`
//! - [`OllamaStreamer`]: `POST /api/generate` with NDJSON streaming
//! - [`open_stream`] / [`collect_fragments`] / [`generate_text`]: open and
//!   accumulate a stream under a deadline and a cancellation token
//! - [`mock`]: deterministic providers for tests

pub mod collect;
pub mod embedder;
mod http;
pub mod mock;
pub mod prompt;
pub mod streamer;

pub use collect::{collect_fragments, generate_text, open_stream};
pub use embedder::OllamaEmbedder;
pub use prompt::build_prompt;
pub use streamer::OllamaStreamer;
