use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::ProviderError;
use crate::messages::ChatTurn;

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Options controlling text generation.
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Text → vector. Dimensionality is fixed per deployment.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError>;
}

/// Streams text fragments for an ordered list of turns.
///
/// Used for the conversational model as well as both summarizers. An empty
/// stream is a valid outcome.
#[async_trait]
pub trait TextStreamer: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        turns: &[ChatTurn],
        options: &GenerateOptions,
    ) -> Result<FragmentStream, ProviderError>;
}
