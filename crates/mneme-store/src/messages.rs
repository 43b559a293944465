use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use mneme_core::{Message, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::timestamp::now_timestamp;

/// Default number of rolling summaries retained per user.
pub const DEFAULT_KEEP_RECENT: usize = 2;

/// A retained rolling summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub id: i64,
    pub user_id: String,
    pub text: String,
    pub created_at: String,
}

/// Raw Log Store: ordered per-user turns plus retained rolling summaries.
pub struct MessageLog {
    db: Database,
}

impl MessageLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a turn. The returned message carries its assigned `sequence_id`.
    pub fn append(&self, user_id: &str, role: Role, content: &str) -> Result<Message, StoreError> {
        let created_at = now_timestamp();
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages (user_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, role.as_str(), content, created_at],
            )?;
            let sequence_id = conn.last_insert_rowid();
            debug!(user_id, %role, sequence_id, "message appended");
            Ok(Message {
                user_id: user_id.to_string(),
                role,
                content: content.to_string(),
                sequence_id,
                created_at,
            })
        })
    }

    /// Up to `limit` most recent messages, oldest first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut messages = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content, created_at FROM messages
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![user_id, limit_param(limit)])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let role_raw: String = row_helpers::get(row, 1, "messages", "role")?;
                out.push(Message {
                    user_id: user_id.to_string(),
                    role: stored_role(&role_raw),
                    content: row_helpers::get(row, 2, "messages", "content")?,
                    sequence_id: row_helpers::get(row, 0, "messages", "id")?,
                    created_at: row_helpers::get(row, 3, "messages", "created_at")?,
                });
            }
            Ok(out)
        })?;
        messages.reverse();
        Ok(messages)
    }

    pub fn count(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    /// Delete every message for the user. Summaries are left alone.
    pub fn clear(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE user_id = ?1", [user_id])?;
            debug!(user_id, deleted, "messages cleared");
            Ok(deleted)
        })
    }

    /// Up to `limit` most recent summaries joined by newline, oldest first.
    pub fn summary_text(&self, user_id: &str, limit: usize) -> Result<Option<String>, StoreError> {
        let summaries = self.latest_summaries(user_id, limit)?;
        if summaries.is_empty() {
            return Ok(None);
        }
        let joined = summaries
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Some(joined))
    }

    /// Insert a summary, then prune to the `keep_recent` newest for the user.
    ///
    /// `keep_recent` below 1 is treated as 1 so an insert always leaves a row.
    pub fn upsert_summary(
        &self,
        user_id: &str,
        text: &str,
        keep_recent: usize,
    ) -> Result<Summary, StoreError> {
        let keep = keep_recent.max(1);
        let created_at = now_timestamp();
        let (summary, remaining) = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let _ = tx.execute(
                "INSERT INTO summaries (user_id, text, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, text, created_at],
            )?;
            let id = tx.last_insert_rowid();
            let pruned = tx.execute(
                "DELETE FROM summaries WHERE user_id = ?1 AND id NOT IN (
                     SELECT id FROM summaries WHERE user_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2
                 )",
                params![user_id, limit_param(keep)],
            )?;
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM summaries WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            debug!(user_id, id, pruned, remaining, "summary stored");
            Ok((
                Summary {
                    id,
                    user_id: user_id.to_string(),
                    text: text.to_string(),
                    created_at: created_at.clone(),
                },
                usize::try_from(remaining).unwrap_or_default(),
            ))
        })?;

        if remaining > keep {
            error!(user_id, count = remaining, keep, "summary retention violated");
            debug_assert!(remaining <= keep, "summary retention violated");
            return Err(StoreError::RetentionViolation {
                user_id: user_id.to_string(),
                count: remaining,
                keep,
            });
        }
        Ok(summary)
    }

    /// All retained summaries for the user, oldest first.
    pub fn summaries(&self, user_id: &str) -> Result<Vec<Summary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, text, created_at FROM summaries
                 WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([user_id], |row| {
                Ok(Summary {
                    id: row.get(0)?,
                    user_id: user_id.to_string(),
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn summary_count(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM summaries WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    /// Delete every summary for the user.
    pub fn clear_summaries(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM summaries WHERE user_id = ?1", [user_id])?))
    }

    fn latest_summaries(&self, user_id: &str, limit: usize) -> Result<Vec<Summary>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut latest = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, text, created_at FROM summaries
                 WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit_param(limit)], |row| {
                Ok(Summary {
                    id: row.get(0)?,
                    user_id: user_id.to_string(),
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        latest.reverse();
        Ok(latest)
    }
}

/// Older files labelled replies with the agent's display name or
/// `assistant`; any label other than `user` or `system` is the agent.
fn stored_role(raw: &str) -> Role {
    raw.parse().unwrap_or(Role::Agent)
}

/// SQLite binds integers as i64.
fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
