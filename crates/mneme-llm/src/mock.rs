//! Deterministic providers for tests: no network, scripted behaviour.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use mneme_core::{ChatTurn, Embedder, FragmentStream, GenerateOptions, ProviderError, TextStreamer};

/// Pre-programmed outcome of one `stream()` call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these fragments, then end.
    Fragments(Vec<String>),
    /// Fail the `stream()` call itself.
    Error(ProviderError),
    /// Yield fragments, then a stream error.
    FailAfter(Vec<String>, ProviderError),
    /// Yield fragments, then never end.
    Stall(Vec<String>),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Fragments(vec![text.to_string()])
    }

    pub fn fragments(parts: &[&str]) -> Self {
        Self::Fragments(parts.iter().map(|p| (*p).to_string()).collect())
    }

    pub fn empty() -> Self {
        Self::Fragments(Vec::new())
    }

    pub fn fail_after(parts: &[&str], error: ProviderError) -> Self {
        Self::FailAfter(parts.iter().map(|p| (*p).to_string()).collect(), error)
    }

    pub fn stall(parts: &[&str]) -> Self {
        Self::Stall(parts.iter().map(|p| (*p).to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Streamer that replays responses in order. After the script runs out the
/// last response repeats.
pub struct MockStreamer {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatTurn>>>,
}

impl MockStreamer {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `text`.
    pub fn always(text: &str) -> Self {
        Self::new(vec![MockResponse::text(text)])
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Turns received by each call, in call order.
    pub fn requests(&self) -> Vec<Vec<ChatTurn>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TextStreamer for MockStreamer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        turns: &[ChatTurn],
        _options: &GenerateOptions,
    ) -> Result<FragmentStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(turns.to_vec());

        let Some(response) = self
            .responses
            .get(idx)
            .or_else(|| self.responses.last())
            .cloned()
        else {
            return Err(ProviderError::Decode(format!(
                "MockStreamer: no response configured for call {idx}"
            )));
        };
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<FragmentStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Fragments(parts) => {
                let items = parts.into_iter().map(Ok::<String, ProviderError>);
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::FailAfter(parts, e) => {
                let items = parts
                    .into_iter()
                    .map(Ok::<String, ProviderError>)
                    .chain(std::iter::once(Err(e)));
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Stall(parts) => {
                let items = parts.into_iter().map(Ok::<String, ProviderError>);
                return Ok(Box::pin(stream::iter(items).chain(stream::pending())));
            }
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Embedder with deterministic bag-of-words vectors.
///
/// Identical texts always produce identical vectors; texts sharing no words
/// are orthogonal unless their words collide in a bucket.
pub struct MockEmbedder {
    dims: usize,
    overrides: HashMap<String, Vec<f64>>,
    failure: Option<ProviderError>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            overrides: HashMap::new(),
            failure: None,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Every call fails with `error`.
    pub fn failing(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new(8)
        }
    }

    /// Return `vector` for exactly `text`.
    pub fn with_vector(mut self, text: &str, vector: Vec<f64>) -> Self {
        let _ = self.overrides.insert(text.to_string(), vector);
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    fn bag_of_words(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.dims];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let bucket = fnv1a(word.as_bytes()) % self.dims as u64;
            v[bucket as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        let _ = self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        if let Some(v) = self.overrides.get(text) {
            return Ok(v.clone());
        }
        Ok(self.bag_of_words(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: FragmentStream) -> Vec<Result<String, ProviderError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn streamer_replays_in_order_then_repeats_last() {
        let streamer = MockStreamer::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        let turns = [ChatTurn::user("q")];
        let opts = GenerateOptions::default();
        for expected in ["first", "second", "second"] {
            let out = collect(streamer.stream(&turns, &opts).await.unwrap()).await;
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].as_deref().unwrap(), expected);
        }
        assert_eq!(streamer.call_count(), 3);
        assert_eq!(streamer.requests().len(), 3);
        assert_eq!(streamer.requests()[0], vec![ChatTurn::user("q")]);
    }

    #[tokio::test]
    async fn streamer_without_script_errors() {
        let streamer = MockStreamer::new(Vec::new());
        let result = streamer.stream(&[], &GenerateOptions::default()).await;
        assert!(matches!(result, Err(ProviderError::Decode(_))));
    }

    #[tokio::test]
    async fn fail_after_yields_then_errors() {
        let streamer = MockStreamer::new(vec![MockResponse::fail_after(
            &["a"],
            ProviderError::StreamInterrupted("cut".into()),
        )]);
        let out = collect(streamer.stream(&[], &GenerateOptions::default()).await.unwrap()).await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = MockEmbedder::new(16);
        let a = embedder.embed("Likes green tea").await.unwrap();
        let b = embedder.embed("likes green TEA").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(a.iter().sum::<f64>(), 3.0);
        assert_eq!(embedder.call_count(), 2);
    }

    #[tokio::test]
    async fn embedder_overrides_and_failures() {
        let embedder = MockEmbedder::new(4).with_vector("x", vec![9.0]);
        assert_eq!(embedder.embed("x").await.unwrap(), vec![9.0]);

        let failing = MockEmbedder::failing(ProviderError::Timeout(Duration::from_secs(60)));
        assert_eq!(failing.embed("x").await.unwrap_err().error_kind(), "timeout");
    }
}
