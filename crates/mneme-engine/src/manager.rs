//! Memory manager.
//!
//! The per-turn flow the transport layer drives:
//!
//! 1. `add_user_turn` records the user's input. A storage failure here is the
//!    only error that aborts a turn.
//! 2. `build_context` assembles the prompt.
//! 3. The caller streams the model reply and accumulates it with
//!    `collect_reply`. A cancelled stream persists nothing.
//! 4. `record_agent_reply` hands the reply to a background task that
//!    compresses and stores it. `add_agent_turn` stores text already in
//!    final form.
//! 5. `maybe_schedule_summary` hands long histories to the background
//!    scheduler.
//!
//! Writes for one user go through a per-user lane, so a reply still being
//! compressed lands in the log before that user's next turn.
//!
//! Semantic indexing, recall, summaries and reply compression are
//! **best-effort**: their failures are logged and never reach the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use mneme_core::{ChatTurn, Embedder, FragmentStream, Message, Role, SourceTag, TextStreamer};
use mneme_llm::collect_fragments;
use mneme_settings::MnemeSettings;
use mneme_store::{Database, MessageLog, SemanticIndex};

use crate::assembler::ContextAssembler;
use crate::compress::ReplyCompressor;
use crate::error::MemoryError;
use crate::scheduler::{SchedulerStats, SummaryOutcome, SummaryScheduler};
use crate::trigger::SummaryPolicy;

/// Grace period for background work on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows removed by [`MemoryManager::clear_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub messages: usize,
    pub summaries: usize,
    pub memories: usize,
}

/// Appends turns and indexes them. Shared with background reply tasks.
struct TurnWriter {
    log: Arc<MessageLog>,
    index: Arc<SemanticIndex>,
    embedder: Arc<dyn Embedder>,
    index_agent_turns: bool,
}

impl TurnWriter {
    async fn user(&self, user_id: &str, text: &str) -> Result<Message, MemoryError> {
        let message = self.log.append(user_id, Role::User, text)?;
        self.index_turn(user_id, text, &SourceTag::User).await;
        Ok(message)
    }

    async fn agent(&self, user_id: &str, text: &str) -> Result<Message, MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MemoryError::EmptyGeneration);
        }
        let message = self.log.append(user_id, Role::Agent, text)?;
        if self.index_agent_turns {
            self.index_turn(user_id, text, &SourceTag::Agent).await;
        }
        Ok(message)
    }

    async fn index_turn(&self, user_id: &str, text: &str, tag: &SourceTag) {
        if text.trim().is_empty() {
            return;
        }
        let embedding = match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    user_id,
                    source = %tag,
                    kind = e.error_kind(),
                    error = %e,
                    "embedding failed, turn not indexed"
                );
                return;
            }
        };
        if let Err(e) = self.index.add(user_id, text, &embedding, tag) {
            warn!(user_id, source = %tag, error = %e, "semantic insert failed");
        }
    }
}

pub struct MemoryManager {
    log: Arc<MessageLog>,
    index: Arc<SemanticIndex>,
    writer: Arc<TurnWriter>,
    assembler: ContextAssembler,
    policy: SummaryPolicy,
    scheduler: SummaryScheduler,
    compressor: Arc<ReplyCompressor>,
    /// One write lane per user; held across a pending reply compression.
    lanes: DashMap<String, Arc<Mutex<()>>>,
    replies: TaskTracker,
    replies_closed: AtomicBool,
    settings: MnemeSettings,
    reply_deadline: Duration,
    cancel: CancellationToken,
}

impl MemoryManager {
    /// `summarizer` serves both the rolling summaries and reply compression.
    pub fn new(
        db: Database,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn TextStreamer>,
        settings: &MnemeSettings,
    ) -> Self {
        let log = Arc::new(MessageLog::new(db.clone()));
        let index = Arc::new(SemanticIndex::new(db));
        let deadline = Duration::from_millis(settings.generation.total_timeout_ms);

        Self {
            assembler: ContextAssembler::new(
                Arc::clone(&log),
                Arc::clone(&index),
                Arc::clone(&embedder),
                settings.context.clone(),
                settings.summary.keep_recent,
            ),
            policy: SummaryPolicy::new(settings.summary.threshold),
            scheduler: SummaryScheduler::new(
                Arc::clone(&log),
                Arc::clone(&summarizer),
                settings.summary.clone(),
                deadline,
            ),
            compressor: Arc::new(ReplyCompressor::new(
                summarizer,
                settings.reply.clone(),
                deadline,
            )),
            writer: Arc::new(TurnWriter {
                log: Arc::clone(&log),
                index: Arc::clone(&index),
                embedder,
                index_agent_turns: settings.context.index_agent_turns,
            }),
            log,
            index,
            lanes: DashMap::new(),
            replies: TaskTracker::new(),
            replies_closed: AtomicBool::new(false),
            settings: settings.clone(),
            reply_deadline: deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn index(&self) -> &SemanticIndex {
        &self.index
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Message shown to the user when generation came back empty.
    pub fn empty_reply_message(&self) -> &str {
        &self.settings.reply.empty_reply_message
    }

    /// Record the user's input, then index it for later recall.
    ///
    /// Waits for a reply to this user that is still being compressed.
    pub async fn add_user_turn(&self, user_id: &str, text: &str) -> Result<Message, MemoryError> {
        let lane = self.lane(user_id);
        let _guard = lane.lock().await;
        self.writer.user(user_id, text).await
    }

    pub async fn build_context(
        &self,
        user_id: &str,
        persona: &str,
        query: &str,
        window: usize,
    ) -> Result<Vec<ChatTurn>, MemoryError> {
        self.assembler
            .build_context(user_id, persona, query, window)
            .await
    }

    /// Store an agent turn as given. Whitespace-only text is rejected.
    pub async fn add_agent_turn(&self, user_id: &str, text: &str) -> Result<Message, MemoryError> {
        let lane = self.lane(user_id);
        let _guard = lane.lock().await;
        self.writer.agent(user_id, text).await
    }

    /// Compress a full reply and store the result as the agent turn.
    ///
    /// Returns once the user's lane is reserved; compression and the append
    /// run in the background. Whitespace-only replies are rejected. After
    /// shutdown the reply is stored on the caller's task.
    pub async fn record_agent_reply(
        &self,
        user_id: &str,
        full_reply: &str,
    ) -> Result<(), MemoryError> {
        if full_reply.trim().is_empty() {
            return Err(MemoryError::EmptyGeneration);
        }
        let guard = self.lane(user_id).lock_owned().await;

        if self.replies_closed.load(Ordering::Acquire) {
            let stored = self.compressor.compress(full_reply, &self.cancel).await;
            let _ = self.writer.agent(user_id, &stored).await?;
            drop(guard);
            return Ok(());
        }

        let writer = Arc::clone(&self.writer);
        let compressor = Arc::clone(&self.compressor);
        let cancel = self.cancel.clone();
        let user_id = user_id.to_string();
        let reply = full_reply.to_string();
        let _ = self.replies.spawn(async move {
            let _guard = guard;
            let stored = compressor.compress(&reply, &cancel).await;
            match writer.agent(&user_id, &stored).await {
                Ok(message) => debug!(
                    user_id,
                    sequence_id = message.sequence_id,
                    "agent reply stored"
                ),
                Err(e) => warn!(user_id, error = %e, "agent reply not recorded"),
            }
        });
        Ok(())
    }

    /// Accumulate a model reply stream. The result is trimmed and non-empty.
    pub async fn collect_reply(
        &self,
        stream: FragmentStream,
        cancel: &CancellationToken,
    ) -> Result<String, MemoryError> {
        let text = collect_fragments(stream, cancel, self.reply_deadline).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(MemoryError::EmptyGeneration);
        }
        Ok(text.to_string())
    }

    /// Evaluate the summary trigger and start a background run when it fires.
    /// Never fails; returns whether a run was started.
    pub fn maybe_schedule_summary(&self, user_id: &str) -> bool {
        if !self.settings.summary.enabled {
            return false;
        }
        let (count, has_summary) = match self.summary_inputs(user_id) {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(user_id, error = %e, "summary trigger check failed");
                return false;
            }
        };
        if !self.policy.should_summarize(count, has_summary) {
            return false;
        }
        let scheduled = self.scheduler.schedule(user_id);
        if scheduled {
            info!(user_id, count, has_summary, "summary scheduled");
        }
        scheduled
    }

    /// Summarize now on the caller's task, bypassing the trigger.
    pub async fn summarize_now(&self, user_id: &str) -> SummaryOutcome {
        self.scheduler.run_now(user_id).await
    }

    /// Wait for pending replies and background summary runs started so far.
    pub async fn wait_for_background(&self) {
        self.replies.close();
        self.replies.wait().await;
        if !self.replies_closed.load(Ordering::Acquire) {
            self.replies.reopen();
        }
        self.scheduler.wait_idle().await;
    }

    /// Remove every message, summary and semantic record for the user.
    pub fn clear_all(&self, user_id: &str) -> Result<ClearReport, MemoryError> {
        let report = ClearReport {
            messages: self.log.clear(user_id)?,
            summaries: self.log.clear_summaries(user_id)?,
            memories: self.index.clear(user_id)?,
        };
        info!(
            user_id,
            messages = report.messages,
            summaries = report.summaries,
            memories = report.memories,
            "user memory cleared"
        );
        Ok(report)
    }

    /// Stop background work, wait for it, then cancel anything left.
    ///
    /// Pending replies still get stored: once cancelled, compression falls
    /// back to the reply prefix.
    pub async fn shutdown(&self) {
        self.replies_closed.store(true, Ordering::Release);
        self.replies.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.replies.wait())
            .await
            .is_err()
        {
            warn!(pending = self.replies.len(), "reply compression still running, cancelling");
        }
        self.scheduler.shutdown(SHUTDOWN_TIMEOUT).await;
        self.cancel.cancel();
        self.replies.wait().await;
        debug!(stats = ?self.scheduler.stats(), "memory manager shut down");
    }

    fn lane(&self, user_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.lanes.entry(user_id.to_string()).or_default().value())
    }

    fn summary_inputs(&self, user_id: &str) -> Result<(usize, bool), MemoryError> {
        let count = self.log.count(user_id)?;
        let has_summary = self.log.summary_count(user_id)? > 0;
        Ok((count, has_summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mneme_core::ProviderError;
    use mneme_llm::mock::{MockEmbedder, MockResponse, MockStreamer};

    fn manager(settings: &MnemeSettings, streamer: MockStreamer) -> MemoryManager {
        MemoryManager::new(
            Database::in_memory().unwrap(),
            Arc::new(MockEmbedder::new(16)),
            Arc::new(streamer),
            settings,
        )
    }

    #[tokio::test]
    async fn user_turn_is_logged_and_indexed() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let msg = m.add_user_turn("u1", "I like green tea").await.unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(m.log().count("u1").unwrap(), 1);
        assert_eq!(m.index().count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn user_turn_survives_embedding_failure() {
        let m = MemoryManager::new(
            Database::in_memory().unwrap(),
            Arc::new(MockEmbedder::failing(ProviderError::Network("down".into()))),
            Arc::new(MockStreamer::always("x")),
            &MnemeSettings::default(),
        );
        let _ = m.add_user_turn("u1", "hello").await.unwrap();
        assert_eq!(m.log().count("u1").unwrap(), 1);
        assert_eq!(m.index().count("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn agent_turn_rejects_blank_text() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let err = m.add_agent_turn("u1", "  \n").await.unwrap_err();
        assert!(matches!(err, MemoryError::EmptyGeneration));
        assert_eq!(m.log().count("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn agent_turns_indexed_only_when_enabled() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let _ = m.add_agent_turn("u1", "reply").await.unwrap();
        assert_eq!(m.index().count("u1").unwrap(), 0);

        let mut settings = MnemeSettings::default();
        settings.context.index_agent_turns = true;
        let m = manager(&settings, MockStreamer::always("x"));
        let _ = m.add_agent_turn("u1", "reply").await.unwrap();
        assert_eq!(m.index().count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn record_agent_reply_stores_compressed_text() {
        let m = manager(
            &MnemeSettings::default(),
            MockStreamer::always("The agent said hello."),
        );
        m.record_agent_reply("u1", "Hello!! So nice to see you again, how was your day?")
            .await
            .unwrap();
        m.wait_for_background().await;

        let history = m.log().recent("u1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Agent);
        assert_eq!(history[0].content, "The agent said hello.");
    }

    #[tokio::test]
    async fn record_agent_reply_rejects_blank_reply() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let err = m.record_agent_reply("u1", " \n ").await.unwrap_err();
        assert!(matches!(err, MemoryError::EmptyGeneration));
        m.wait_for_background().await;
        assert_eq!(m.log().count("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_compression_does_not_block_the_caller() {
        tokio::time::pause();
        let m = manager(
            &MnemeSettings::default(),
            MockStreamer::new(vec![MockResponse::delayed(
                Duration::from_secs(90),
                MockResponse::text("short"),
            )]),
        );
        let _ = m.add_user_turn("u1", "first").await.unwrap();

        let started = tokio::time::Instant::now();
        m.record_agent_reply("u1", "a long and winding reply").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(90));
        assert_eq!(m.log().count("u1").unwrap(), 1);

        // The next turn queues behind the pending reply.
        let _ = m.add_user_turn("u1", "second").await.unwrap();
        let contents: Vec<String> = m
            .log()
            .recent("u1", 10)
            .unwrap()
            .into_iter()
            .map(|msg| msg.content)
            .collect();
        assert_eq!(contents, vec!["first", "short", "second"]);
    }

    #[tokio::test]
    async fn pending_reply_does_not_hold_other_users() {
        tokio::time::pause();
        let m = manager(
            &MnemeSettings::default(),
            MockStreamer::new(vec![MockResponse::stall(&[])]),
        );
        m.record_agent_reply("u1", "never compressed").await.unwrap();

        let started = tokio::time::Instant::now();
        let _ = m.add_user_turn("u2", "hello").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(m.log().count("u2").unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_stores_pending_reply_prefix() {
        tokio::time::pause();
        let mut settings = MnemeSettings::default();
        settings.reply.fallback_chars = 5;
        let m = manager(&settings, MockStreamer::new(vec![MockResponse::stall(&[])]));
        m.record_agent_reply("u1", "abcdefghij").await.unwrap();

        m.shutdown().await;
        let history = m.log().recent("u1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "abcde");

        // Replies after shutdown are stored inline.
        m.record_agent_reply("u1", "klmnopqrst").await.unwrap();
        assert_eq!(m.log().count("u1").unwrap(), 2);
    }

    #[tokio::test]
    async fn collect_reply_trims_and_rejects_empty() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let cancel = CancellationToken::new();
        let stream: FragmentStream = Box::pin(futures::stream::iter(vec![
            Ok::<_, ProviderError>("  Hi".to_string()),
            Ok(" there \n".to_string()),
        ]));
        assert_eq!(m.collect_reply(stream, &cancel).await.unwrap(), "Hi there");

        let blank: FragmentStream =
            Box::pin(futures::stream::iter(vec![Ok::<_, ProviderError>("  ".to_string())]));
        assert!(matches!(
            m.collect_reply(blank, &cancel).await,
            Err(MemoryError::EmptyGeneration)
        ));
    }

    #[tokio::test]
    async fn cancelled_reply_persists_nothing() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let _ = m.add_user_turn("u1", "tell me a story").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream: FragmentStream =
            Box::pin(futures::stream::pending::<Result<String, ProviderError>>());
        let err = m.collect_reply(stream, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(m.log().count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_summaries_never_schedule() {
        let mut settings = MnemeSettings::default();
        settings.summary.enabled = false;
        settings.summary.threshold = 2;
        let m = manager(&settings, MockStreamer::always("sum"));
        for _ in 0..4 {
            let _ = m.add_user_turn("u1", "x").await.unwrap();
        }
        assert!(!m.maybe_schedule_summary("u1"));
    }

    #[tokio::test]
    async fn clear_all_removes_everything() {
        let m = manager(&MnemeSettings::default(), MockStreamer::always("x"));
        let _ = m.add_user_turn("u1", "alpha").await.unwrap();
        let _ = m.add_user_turn("u2", "beta").await.unwrap();
        let _ = m.log().upsert_summary("u1", "s", 2).unwrap();

        let report = m.clear_all("u1").unwrap();
        assert_eq!(
            report,
            ClearReport {
                messages: 1,
                summaries: 1,
                memories: 1
            }
        );
        assert_eq!(m.log().count("u2").unwrap(), 1);
        assert_eq!(m.clear_all("u1").unwrap(), ClearReport::default());
    }

    #[tokio::test]
    async fn shutdown_stops_scheduling() {
        let mut settings = MnemeSettings::default();
        settings.summary.threshold = 1;
        settings.summary.min_messages = 1;
        let m = manager(&settings, MockStreamer::new(vec![MockResponse::text("s")]));
        let _ = m.add_user_turn("u1", "x").await.unwrap();
        m.shutdown().await;
        assert!(!m.maybe_schedule_summary("u1"));
    }
}
