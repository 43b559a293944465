//! Prompt context assembly.
//!
//! `build_context` produces, in order:
//!
//! 1. the persona system entry (persona plus the anti-repetition instruction)
//! 2. the retained rolling summary, when one exists
//! 3. semantic memories that are not already visible in the recent turns
//! 4. the smart-filtered recent turns, oldest first
//!
//! Only the raw log read for step 4 can fail the call. A failing summary
//! read, embedding or search degrades to "no augmentation" with a warning.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use mneme_core::{ChatTurn, Embedder, SourceTag};
use mneme_settings::ContextSettings;
use mneme_store::{MessageLog, SearchOptions, SemanticIndex};

use crate::error::MemoryError;
use crate::recent::smart_recent;

/// With a summary present the window shrinks by this much...
pub const SUMMARY_WINDOW_SHRINK: usize = 2;
/// ...but never below this.
pub const MIN_WINDOW_WITH_SUMMARY: usize = 6;

const MEMORIES_HEADER: &str = "Relevant past memories:";

/// Window actually used for recent turns.
pub fn effective_window(window: usize, has_summary: bool) -> usize {
    if has_summary {
        window
            .saturating_sub(SUMMARY_WINDOW_SHRINK)
            .max(MIN_WINDOW_WITH_SUMMARY)
    } else {
        window
    }
}

fn persona_entry(persona: &str, instruction: &str) -> ChatTurn {
    let instruction = instruction.trim();
    if instruction.is_empty() {
        ChatTurn::system(persona)
    } else {
        ChatTurn::system(format!("{persona}\n\n{instruction}"))
    }
}

fn summary_entry(summary: &str) -> ChatTurn {
    ChatTurn::system(format!(
        "Previous conversation context: {summary}\n\n\
         Note: This summary describes past conversations. 'The user' refers to the person \
         you're talking to, and 'the agent' refers to your previous responses."
    ))
}

fn memories_entry(memories: &[String]) -> ChatTurn {
    let lines: Vec<String> = memories.iter().map(|m| format!("- {m}")).collect();
    ChatTurn::system(format!("{MEMORIES_HEADER}\n{}", lines.join("\n")))
}

/// Stateless view over the two stores that builds model context.
pub struct ContextAssembler {
    log: Arc<MessageLog>,
    index: Arc<SemanticIndex>,
    embedder: Arc<dyn Embedder>,
    settings: ContextSettings,
    summary_limit: usize,
}

impl ContextAssembler {
    pub fn new(
        log: Arc<MessageLog>,
        index: Arc<SemanticIndex>,
        embedder: Arc<dyn Embedder>,
        settings: ContextSettings,
        summary_limit: usize,
    ) -> Self {
        Self {
            log,
            index,
            embedder,
            settings,
            summary_limit: summary_limit.max(1),
        }
    }

    pub async fn build_context(
        &self,
        user_id: &str,
        persona: &str,
        query: &str,
        window: usize,
    ) -> Result<Vec<ChatTurn>, MemoryError> {
        let mut context = vec![persona_entry(
            persona,
            &self.settings.anti_repetition_instruction,
        )];

        let summary = match self.log.summary_text(user_id, self.summary_limit) {
            Ok(summary) => summary.filter(|s| !s.trim().is_empty()),
            Err(e) => {
                warn!(user_id, error = %e, "summary read failed, continuing without it");
                None
            }
        };
        let window = effective_window(window, summary.is_some());
        if let Some(summary) = &summary {
            context.push(summary_entry(summary));
        }

        let recalled = self.recall(user_id, query).await;

        let history = self.log.recent(user_id, window.saturating_mul(2))?;
        let recent = smart_recent(history, window, self.settings.max_agent_turns);

        let visible: HashSet<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        let mut seen = HashSet::new();
        let memories: Vec<String> = recalled
            .into_iter()
            .filter(|m| !visible.contains(m.as_str()))
            .filter(|m| seen.insert(m.clone()))
            .collect();

        debug!(
            user_id,
            window,
            has_summary = summary.is_some(),
            memories = memories.len(),
            recent = recent.len(),
            "context assembled"
        );

        if !memories.is_empty() {
            context.push(memories_entry(&memories));
        }
        context.extend(recent.into_iter().map(|m| ChatTurn::new(m.role, m.content)));
        Ok(context)
    }

    /// Semantic recall for `query`, best first. Empty on any failure.
    async fn recall(&self, user_id: &str, query: &str) -> Vec<String> {
        if query.trim().is_empty() || self.settings.top_k == 0 {
            return Vec::new();
        }
        let embedding = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    user_id,
                    provider = self.embedder.name(),
                    kind = e.error_kind(),
                    error = %e,
                    "query embedding failed, skipping semantic recall"
                );
                return Vec::new();
            }
        };
        let opts = SearchOptions {
            top_k: self.settings.top_k,
            min_score: self.settings.min_score,
            exclude_source: Some(SourceTag::Agent),
        };
        match self.index.search(user_id, &embedding, &opts) {
            Ok(hits) => hits.into_iter().map(|h| h.record.content).collect(),
            Err(e) => {
                warn!(user_id, error = %e, "semantic search failed, skipping recall");
                Vec::new()
            }
        }
    }
}
