use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mneme_core::{ChatTurn, GenerateOptions, TextStreamer};
use mneme_llm::generate_text;
use mneme_settings::ReplySettings;

/// Compresses a full agent reply into one stored sentence.
pub struct ReplyCompressor {
    streamer: Arc<dyn TextStreamer>,
    settings: ReplySettings,
    deadline: Duration,
}

impl ReplyCompressor {
    pub fn new(streamer: Arc<dyn TextStreamer>, settings: ReplySettings, deadline: Duration) -> Self {
        Self {
            streamer,
            settings,
            deadline,
        }
    }

    /// Text to store for `reply`. Never fails: with compression disabled the
    /// trimmed reply is returned, and on summarizer failure or empty output the
    /// first `fallback_chars` characters.
    pub async fn compress(&self, reply: &str, cancel: &CancellationToken) -> String {
        let reply = reply.trim();
        if !self.settings.compress || reply.is_empty() {
            return reply.to_string();
        }

        let turns = [
            ChatTurn::system(self.settings.instruction.clone()),
            ChatTurn::user(reply),
        ];
        match generate_text(
            self.streamer.as_ref(),
            &turns,
            &GenerateOptions::default(),
            cancel,
            self.deadline,
        )
        .await
        {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim();
                debug!(from = reply.len(), to = text.len(), "reply compressed");
                text.to_string()
            }
            Ok(_) => {
                warn!("reply compression produced no text, storing prefix");
                self.fallback(reply)
            }
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "reply compression failed, storing prefix");
                self.fallback(reply)
            }
        }
    }

    fn fallback(&self, reply: &str) -> String {
        char_prefix(reply, self.settings.fallback_chars).to_string()
    }
}

/// First `n` characters of `s`, cut on a char boundary.
pub fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
