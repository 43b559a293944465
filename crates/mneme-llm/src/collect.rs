//! Accumulating fragment streams under a deadline and a cancellation token.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mneme_core::{ChatTurn, FragmentStream, GenerateOptions, ProviderError, TextStreamer};

/// Concatenate every fragment of `stream`.
///
/// Fails with `Cancelled` when `cancel` fires, `Timeout` when `deadline`
/// elapses, or the first error the stream yields. Partial text is dropped in
/// every failure case. The result is not trimmed.
pub async fn collect_fragments(
    mut stream: FragmentStream,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<String, ProviderError> {
    let sleep = tokio::time::sleep(deadline);
    tokio::pin!(sleep);

    let mut text = String::new();
    let mut fragments = 0usize;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(fragments, "stream collection cancelled");
                return Err(ProviderError::Cancelled);
            }
            () = &mut sleep => {
                debug!(fragments, "stream collection deadline reached");
                return Err(ProviderError::Timeout(deadline));
            }
            next = stream.next() => match next {
                Some(Ok(fragment)) => {
                    fragments += 1;
                    text.push_str(&fragment);
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(text),
            },
        }
    }
}

/// Open a stream on `streamer`, giving up on `cancel` or after `deadline`.
///
/// Only the request is bounded. Pass what is left of the deadline on to
/// [`collect_fragments`].
pub async fn open_stream(
    streamer: &dyn TextStreamer,
    turns: &[ChatTurn],
    options: &GenerateOptions,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<FragmentStream, ProviderError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(provider = streamer.name(), "stream open cancelled");
            Err(ProviderError::Cancelled)
        }
        opened = tokio::time::timeout(deadline, streamer.stream(turns, options)) => {
            opened.map_err(|_| ProviderError::Timeout(deadline))?
        }
    }
}

/// Open a stream on `streamer` and collect it, with `deadline` covering both
/// the request and the whole stream.
pub async fn generate_text(
    streamer: &dyn TextStreamer,
    turns: &[ChatTurn],
    options: &GenerateOptions,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<String, ProviderError> {
    let started = Instant::now();
    let stream = open_stream(streamer, turns, options, cancel, deadline).await?;
    let remaining = deadline.saturating_sub(started.elapsed());
    collect_fragments(stream, cancel, remaining).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockStreamer};

    fn fragments(parts: &[&str]) -> FragmentStream {
        let items: Vec<Result<String, ProviderError>> =
            parts.iter().map(|p| Ok((*p).to_string())).collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn concatenates_fragments() {
        let cancel = CancellationToken::new();
        let text = collect_fragments(fragments(&["a", "b", " c "]), &cancel, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(text, "ab c ");
    }

    #[tokio::test]
    async fn empty_stream_is_empty_text() {
        let cancel = CancellationToken::new();
        let text = collect_fragments(fragments(&[]), &cancel, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn stream_error_propagates() {
        let cancel = CancellationToken::new();
        let items: Vec<Result<String, ProviderError>> = vec![
            Ok("partial".into()),
            Err(ProviderError::StreamInterrupted("reset".into())),
        ];
        let err = collect_fragments(Box::pin(futures::stream::iter(items)), &cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = collect_fragments(fragments(&["a"]), &cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_stream_hits_deadline() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let stalled: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, ProviderError>("a".to_string())])
                .chain(futures::stream::pending()),
        );
        let err = collect_fragments(stalled, &cancel, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn cancellation_mid_stream() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let stalled: FragmentStream =
            Box::pin(futures::stream::pending::<Result<String, ProviderError>>());
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = collect_fragments(stalled, &cancel, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn generate_text_bounds_slow_open() {
        tokio::time::pause();
        let streamer = MockStreamer::new(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::text("late"),
        )]);
        let cancel = CancellationToken::new();
        let err = generate_text(
            &streamer,
            &[ChatTurn::user("x")],
            &GenerateOptions::default(),
            &cancel,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_kind(), "timeout");
    }

    #[tokio::test]
    async fn open_stream_times_out_on_slow_server() {
        tokio::time::pause();
        let streamer = MockStreamer::new(vec![MockResponse::delayed(
            Duration::from_secs(300),
            MockResponse::text("late"),
        )]);
        let started = Instant::now();
        let result = open_stream(
            &streamer,
            &[ChatTurn::user("x")],
            &GenerateOptions::default(),
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(300));
    }

    #[tokio::test]
    async fn open_stream_honours_cancellation() {
        tokio::time::pause();
        let streamer = MockStreamer::new(vec![MockResponse::delayed(
            Duration::from_secs(300),
            MockResponse::text("late"),
        )]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result = open_stream(
            &streamer,
            &[ChatTurn::user("x")],
            &GenerateOptions::default(),
            &cancel,
            Duration::from_secs(120),
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test]
    async fn open_stream_returns_live_stream() {
        let streamer = MockStreamer::new(vec![MockResponse::fragments(&["a", "b"])]);
        let cancel = CancellationToken::new();
        let stream = open_stream(
            &streamer,
            &[ChatTurn::user("x")],
            &GenerateOptions::default(),
            &cancel,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let text = collect_fragments(stream, &cancel, Duration::from_secs(1)).await.unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn generate_text_collects() {
        let streamer = MockStreamer::new(vec![MockResponse::fragments(&["one", " two"])]);
        let cancel = CancellationToken::new();
        let text = generate_text(
            &streamer,
            &[ChatTurn::user("x")],
            &GenerateOptions::default(),
            &cancel,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(text, "one two");
        assert_eq!(streamer.call_count(), 1);
    }
}
