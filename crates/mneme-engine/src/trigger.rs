//! When to roll a new conversation summary.

/// Summary trigger evaluated after each completed turn.
///
/// Fires once the log reaches `threshold` messages and no summary exists yet,
/// and afterwards on every exact multiple of `threshold`.
#[derive(Clone, Copy, Debug)]
pub struct SummaryPolicy {
    threshold: usize,
}

impl SummaryPolicy {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn should_summarize(&self, message_count: usize, has_summary: bool) -> bool {
        message_count >= self.threshold && (!has_summary || message_count % self.threshold == 0)
    }
}
