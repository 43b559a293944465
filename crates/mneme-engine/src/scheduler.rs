//! Background rolling-summary runs.
//!
//! Each run is its own failure boundary: whatever happens inside it is logged
//! and counted, never returned to the foreground turn. At most one run per
//! user is in flight at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use mneme_core::{ChatTurn, GenerateOptions, Role, TextStreamer};
use mneme_llm::generate_text;
use mneme_settings::SummarySettings;
use mneme_store::{MessageLog, Summary};

use crate::error::MemoryError;

/// How one summary run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SummaryOutcome {
    Stored(Summary),
    /// Fewer messages than the configured minimum.
    TooFewMessages(usize),
    EmptyOutput,
    AlreadyRunning,
    Failed(String),
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    log: Arc<MessageLog>,
    summarizer: Arc<dyn TextStreamer>,
    settings: SummarySettings,
    deadline: Duration,
    in_flight: DashMap<String, ()>,
    counters: Counters,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Marks a user's run as in flight until dropped, panics included.
struct InFlightGuard {
    inner: Arc<Inner>,
    user_id: String,
}

impl InFlightGuard {
    fn claim(inner: &Arc<Inner>, user_id: &str) -> Option<Self> {
        match inner.in_flight.entry(user_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let _ = slot.insert(());
                Some(Self {
                    inner: Arc::clone(inner),
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    async fn run(self) -> SummaryOutcome {
        self.inner.run(&self.user_id).await
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _ = self.inner.in_flight.remove(&self.user_id);
    }
}

pub struct SummaryScheduler {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

impl SummaryScheduler {
    /// `deadline` bounds each summarizer call end to end.
    pub fn new(
        log: Arc<MessageLog>,
        summarizer: Arc<dyn TextStreamer>,
        settings: SummarySettings,
        deadline: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                summarizer,
                settings,
                deadline,
                in_flight: DashMap::new(),
                counters: Counters::default(),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Start a background run for `user_id`.
    ///
    /// Returns false when a run for the user is already in flight or the
    /// scheduler has been shut down. Must be called inside a Tokio runtime.
    pub fn schedule(&self, user_id: &str) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(user_id, "scheduler closed, summary not scheduled");
            return false;
        }
        let Some(guard) = InFlightGuard::claim(&self.inner, user_id) else {
            let _ = self.inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(user_id, "summary already running");
            return false;
        };
        let _ = self.inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let _ = self.tracker.spawn(async move {
            let _ = guard.run().await;
        });
        true
    }

    /// Run the pipeline on the caller's task. Same boundary and counters as a
    /// scheduled run.
    pub async fn run_now(&self, user_id: &str) -> SummaryOutcome {
        match InFlightGuard::claim(&self.inner, user_id) {
            Some(guard) => guard.run().await,
            None => {
                let _ = self.inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
                SummaryOutcome::AlreadyRunning
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every run started so far has finished. New runs may be
    /// scheduled afterwards.
    pub async fn wait_idle(&self) {
        let _ = self.tracker.close();
        self.tracker.wait().await;
        let _ = self.tracker.reopen();
    }

    /// Stop accepting runs and wait for in-flight ones. Runs still going after
    /// `timeout` are cancelled.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.tracker.close();
        info!(in_flight = self.tracker.len(), "waiting for summary runs");
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(?timeout, "summary runs still active, cancelling");
            self.inner.cancel.cancel();
            self.tracker.wait().await;
        }
    }
}

impl Inner {
    async fn run(&self, user_id: &str) -> SummaryOutcome {
        let outcome = match self.summarize(user_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id, error = %e, "summary run failed");
                SummaryOutcome::Failed(e.to_string())
            }
        };

        let counter = match &outcome {
            SummaryOutcome::Stored(summary) => {
                info!(user_id, summary_id = summary.id, chars = summary.text.len(), "summary stored");
                &self.counters.completed
            }
            SummaryOutcome::Failed(_) => &self.counters.failed,
            SummaryOutcome::TooFewMessages(n) => {
                debug!(user_id, messages = n, "not enough history to summarize");
                &self.counters.skipped
            }
            SummaryOutcome::EmptyOutput => {
                warn!(user_id, "summarizer produced no text");
                &self.counters.skipped
            }
            SummaryOutcome::AlreadyRunning => &self.counters.skipped,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn summarize(&self, user_id: &str) -> Result<SummaryOutcome, MemoryError> {
        let history = self.log.recent(user_id, self.settings.fetch_limit)?;
        if history.len() < self.settings.min_messages {
            return Ok(SummaryOutcome::TooFewMessages(history.len()));
        }

        let mut turns = Vec::with_capacity(history.len() + 1);
        turns.push(ChatTurn::system(self.settings.instruction.clone()));
        turns.extend(
            history
                .into_iter()
                .filter(|m| matches!(m.role, Role::User | Role::Agent))
                .map(|m| ChatTurn::new(m.role, m.content)),
        );

        let text = generate_text(
            self.summarizer.as_ref(),
            &turns,
            &GenerateOptions::default(),
            &self.cancel,
            self.deadline,
        )
        .await?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(SummaryOutcome::EmptyOutput);
        }

        let summary = self
            .log
            .upsert_summary(user_id, text, self.settings.keep_recent)?;
        Ok(SummaryOutcome::Stored(summary))
    }
}
