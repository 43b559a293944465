use mneme_core::{ChatTurn, Role};

/// Flatten turns into a completion prompt.
///
/// System entries are emitted verbatim; other turns become `role: content`
/// lines. The prompt ends with an `agent:` cue for the model to continue.
pub fn build_prompt(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        match turn.role {
            Role::System => {
                prompt.push_str(turn.content.trim_end());
                prompt.push('\n');
            }
            role => {
                prompt.push_str(role.as_str());
                prompt.push_str(": ");
                prompt.push_str(&turn.content);
                prompt.push('\n');
            }
        }
    }
    prompt.push_str("agent:");
    prompt
}
