use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use mneme_core::{ChatTurn, FragmentStream, GenerateOptions, ProviderError, TextStreamer};
use mneme_settings::GenerationSettings;

use crate::http;
use crate::prompt::build_prompt;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateRequestOptions,
}

#[derive(Serialize)]
struct GenerateRequestOptions {
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

/// One NDJSON line of `/api/generate` output.
#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Streaming text generation against Ollama's `/api/generate`.
pub struct OllamaStreamer {
    client: Client,
    endpoint: String,
    model: String,
    default_max_tokens: u32,
    idle_timeout: Duration,
}

impl OllamaStreamer {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        default_max_tokens: u32,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(connect_timeout)?,
            endpoint: http::endpoint(base_url, "api/generate"),
            model: model.into(),
            default_max_tokens,
            idle_timeout,
        })
    }

    pub fn from_settings(settings: &GenerationSettings) -> Result<Self, ProviderError> {
        Self::new(
            &settings.base_url,
            settings.model.clone(),
            settings.max_tokens,
            Duration::from_millis(settings.connect_timeout_ms),
            Duration::from_millis(settings.idle_timeout_ms),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextStreamer for OllamaStreamer {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self, turns, options), fields(model = %self.model, turns = turns.len()))]
    async fn stream(
        &self,
        turns: &[ChatTurn],
        options: &GenerateOptions,
    ) -> Result<FragmentStream, ProviderError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(turns),
            stream: true,
            options: GenerateRequestOptions {
                num_predict: options.max_tokens.unwrap_or(self.default_max_tokens),
                temperature: options.temperature,
            },
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::map_reqwest_error(&e, self.idle_timeout))?;
        let resp = http::check_status(resp).await?;

        Ok(Box::pin(NdjsonStream::new(resp.bytes_stream(), self.idle_timeout)))
    }
}

/// Wraps a byte stream of NDJSON generate chunks and yields text fragments.
///
/// Ends after a chunk with `done: true`, on transport error, or when no data
/// arrives within the idle timeout.
struct NdjsonStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ProviderError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl NdjsonStream {
    fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        if self.finished {
            return;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let chunk: GenerateChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping undecodable generate line");
                return;
            }
        };
        if let Some(error) = chunk.error {
            self.pending
                .push_back(Err(ProviderError::StreamInterrupted(error)));
            self.finished = true;
            return;
        }
        if let Some(text) = chunk.response.filter(|t| !t.is_empty()) {
            self.pending.push_back(Ok(text));
        }
        if chunk.done {
            self.finished = true;
        }
    }
}

impl Stream for NdjsonStream {
    type Item = Result<String, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let next = tokio::time::Instant::now() + this.idle_duration;
                    this.idle_deadline.as_mut().reset(next);
                    this.buffer.extend_from_slice(&bytes);
                    this.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                Poll::Ready(None) => {
                    let rest = std::mem::take(&mut this.buffer);
                    this.handle_line(&rest);
                    this.finished = true;
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(ProviderError::Timeout(this.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bytes_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c.as_bytes()))),
        )
    }

    async fn drain(stream: NdjsonStream) -> Vec<Result<String, ProviderError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn yields_response_fragments_until_done() {
        let stream = NdjsonStream::new(
            bytes_stream(vec![
                "{\"response\":\"Hel\",\"done\":false}\n",
                "{\"response\":\"lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
                "{\"response\":\"ignored\",\"done\":false}\n",
            ]),
            Duration::from_secs(5),
        );
        let out: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let stream = NdjsonStream::new(
            bytes_stream(vec!["{\"respo", "nse\":\"ab\"}\n{\"response\":\"c\"}"]),
            Duration::from_secs(5),
        );
        let out: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["ab", "c"]);
    }

    #[tokio::test]
    async fn undecodable_lines_are_skipped() {
        let stream = NdjsonStream::new(
            bytes_stream(vec!["garbage\n", "\n", "{\"response\":\"ok\"}\n"]),
            Duration::from_secs(5),
        );
        let out: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["ok"]);
    }

    #[tokio::test]
    async fn error_line_ends_stream_with_error() {
        let stream = NdjsonStream::new(
            bytes_stream(vec![
                "{\"response\":\"partial\"}\n",
                "{\"error\":\"model crashed\"}\n",
                "{\"response\":\"never\"}\n",
            ]),
            Duration::from_secs(5),
        );
        let out = drain(stream).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_deref().unwrap(), "partial");
        assert!(matches!(&out[1], Err(ProviderError::StreamInterrupted(m)) if m == "model crashed"));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();
        let mut stream = Box::pin(NdjsonStream::new(
            futures::stream::pending::<Result<Bytes, reqwest::Error>>(),
            Duration::from_millis(100),
        ));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ProviderError::Timeout(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn streams_from_server() {
        let server = MockServer::start().await;
        let body = "{\"response\":\"Hi\",\"done\":false}\n{\"response\":\" there\",\"done\":false}\n{\"done\":true}\n";
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama3:8b-instruct-q4_K_M",
                "prompt": "persona\nuser: hi\nagent:",
                "stream": true,
                "options": {"num_predict": 64}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .expect(1)
            .mount(&server)
            .await;

        let streamer = OllamaStreamer::new(
            &server.uri(),
            "llama3:8b-instruct-q4_K_M",
            128,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .unwrap();
        let turns = vec![ChatTurn::system("persona"), ChatTurn::user("hi")];
        let options = GenerateOptions {
            max_tokens: Some(64),
            temperature: None,
        };
        let stream = streamer.stream(&turns, &options).await.unwrap();
        let text: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(text.concat(), "Hi there");
    }

    #[tokio::test]
    async fn server_error_status_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let streamer = OllamaStreamer::from_settings(&GenerationSettings {
            base_url: server.uri(),
            ..GenerationSettings::default()
        })
        .unwrap();
        let err = match streamer
            .stream(&[ChatTurn::user("x")], &GenerateOptions::default())
            .await
        {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, ProviderError::Status { status: 500, .. }));
    }
}
