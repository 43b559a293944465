//! Smart recent-message selection.

use mneme_core::{Message, Role};

/// Trim a chronological slice of history to what goes into the prompt.
///
/// Keeps every user turn and only the `max_agent` most recent agent turns,
/// preserving chronological order, then keeps the last `window` of those.
/// System entries never appear in the result.
pub fn smart_recent(history: Vec<Message>, window: usize, max_agent: usize) -> Vec<Message> {
    let agent_total = history.iter().filter(|m| m.role == Role::Agent).count();
    let first_kept_agent = agent_total.saturating_sub(max_agent);

    let mut agent_seen = 0usize;
    let mut kept: Vec<Message> = history
        .into_iter()
        .filter(|m| match m.role {
            Role::User => true,
            Role::Agent => {
                let ordinal = agent_seen;
                agent_seen += 1;
                ordinal >= first_kept_agent
            }
            Role::System => false,
        })
        .collect();

    let excess = kept.len().saturating_sub(window);
    let _ = kept.drain(..excess);
    kept
}
