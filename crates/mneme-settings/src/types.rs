//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a settings file
//! only needs the fields it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the memory core.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MnemeSettings {
    pub storage: StorageSettings,
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
    pub context: ContextSettings,
    pub summary: SummarySettings,
    pub reply: ReplySettings,
    pub logging: LoggingSettings,
}

impl MnemeSettings {
    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.context.window == 0 {
            return Err(SettingsError::InvalidValue(
                "context.window must be at least 1".into(),
            ));
        }
        if self.summary.keep_recent == 0 {
            return Err(SettingsError::InvalidValue(
                "summary.keepRecent must be at least 1".into(),
            ));
        }
        if self.summary.threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "summary.threshold must be at least 1".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.context.min_score) {
            return Err(SettingsError::InvalidValue(format!(
                "context.minScore {} outside [-1, 1]",
                self.context.min_score
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Path to the `SQLite` file. May start with `~/`.
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "~/.mneme/memory.db".to_string(),
        }
    }
}

impl StorageSettings {
    /// Resolve the database path, expanding `~/` to the home directory.
    pub fn resolved_db_path(&self) -> String {
        if self.db_path.starts_with("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}{}", home, &self.db_path[1..]);
            }
        }
        self.db_path.clone()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingSettings {
    pub base_url: String,
    pub model: String,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            connect_timeout_ms: 10_000,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub connect_timeout_ms: u64,
    /// Abort when no fragment arrives for this long.
    pub idle_timeout_ms: u64,
    /// Upper bound on a whole generation, first byte to end-of-stream.
    pub total_timeout_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3:8b-instruct-q4_K_M".to_string(),
            max_tokens: 128,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            total_timeout_ms: 120_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Literal recent turns included in assembled context.
    pub window: usize,
    /// Agent-authored turns kept inside the recent window.
    pub max_agent_turns: usize,
    pub top_k: usize,
    pub min_score: f64,
    /// Appended to the persona prompt on every turn.
    pub anti_repetition_instruction: String,
    /// Also embed agent replies (tagged `agent`, never recalled).
    pub index_agent_turns: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            window: 8,
            max_agent_turns: 2,
            top_k: 5,
            min_score: 0.75,
            anti_repetition_instruction: "Do not repeat your previous responses verbatim."
                .to_string(),
            index_agent_turns: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummarySettings {
    pub enabled: bool,
    pub threshold: usize,
    pub keep_recent: usize,
    pub fetch_limit: usize,
    pub min_messages: usize,
    pub instruction: String,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 20,
            keep_recent: 2,
            fetch_limit: 50,
            min_messages: 10,
            instruction: "Summarize the conversation below in two or three factual sentences. \
                          Refer to the human as \"the user\" and to the assistant as \"the agent\". \
                          Keep names, preferences and commitments; drop greetings."
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplySettings {
    /// Compress each agent reply to one sentence before storing it.
    pub compress: bool,
    /// Characters of the raw reply kept when compression fails.
    pub fallback_chars: usize,
    pub instruction: String,
    /// Shown to the user when the model produced nothing.
    pub empty_reply_message: String,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            compress: true,
            fallback_chars: 200,
            instruction: "Rewrite the reply below as one short factual sentence describing \
                          what the agent said. Output only that sentence."
                .to_string(),
            empty_reply_message: "Sorry~ can you ask again?".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = MnemeSettings::default();
        assert_eq!(s.context.window, 8);
        assert_eq!(s.context.max_agent_turns, 2);
        assert_eq!(s.context.top_k, 5);
        assert!((s.context.min_score - 0.75).abs() < f64::EPSILON);
        assert_eq!(s.summary.threshold, 20);
        assert_eq!(s.summary.keep_recent, 2);
        assert_eq!(s.summary.fetch_limit, 50);
        assert_eq!(s.summary.min_messages, 10);
        assert_eq!(s.reply.fallback_chars, 200);
        assert_eq!(s.embedding.model, "nomic-embed-text");
        assert_eq!(s.generation.max_tokens, 128);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serde_camel_case() {
        let value = serde_json::to_value(MnemeSettings::default()).unwrap();
        assert!(value["context"].get("maxAgentTurns").is_some());
        assert!(value["summary"].get("keepRecent").is_some());
        assert!(value["context"].get("max_agent_turns").is_none());
    }

    #[test]
    fn partial_json_with_defaults() {
        let s: MnemeSettings =
            serde_json::from_str(r#"{"summary": {"threshold": 30}}"#).unwrap();
        assert_eq!(s.summary.threshold, 30);
        assert_eq!(s.summary.keep_recent, 2);
        assert_eq!(s.context.window, 8);
    }

    #[test]
    fn validate_rejects_zero_keep_recent() {
        let mut s = MnemeSettings::default();
        s.summary.keep_recent = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_score() {
        let mut s = MnemeSettings::default();
        s.context.min_score = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn resolved_db_path_absolute_passthrough() {
        let storage = StorageSettings {
            db_path: "/var/lib/mneme.db".into(),
        };
        assert_eq!(storage.resolved_db_path(), "/var/lib/mneme.db");
    }
}
