//! Per-turn memory flow for a conversational agent.
//!
//! [`MemoryManager`] is the entry point for a transport layer. The pieces it
//! wires together are usable on their own:
//!
//! - [`ContextAssembler`] builds bounded, deduplicated model context
//! - [`smart_recent`] selects literal recent turns
//! - [`SummaryPolicy`] decides when a rolling summary is due
//! - [`SummaryScheduler`] runs summaries in the background
//! - [`ReplyCompressor`] shrinks agent replies before they are stored

pub mod assembler;
pub mod compress;
pub mod error;
pub mod manager;
pub mod recent;
pub mod scheduler;
pub mod trigger;

pub use assembler::{effective_window, ContextAssembler};
pub use compress::ReplyCompressor;
pub use error::MemoryError;
pub use manager::{ClearReport, MemoryManager};
pub use recent::smart_recent;
pub use scheduler::{SchedulerStats, SummaryOutcome, SummaryScheduler};
pub use trigger::SummaryPolicy;
