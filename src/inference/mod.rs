pub mod gemini;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::InferenceError;
use crate::types::{GeneratedImage, GenerationRequest, ImageRequest, ModelInfo};

/// Lazy, finite, non-restartable sequence of text fragments for one request.
pub type FragmentStream = BoxStream<'static, Result<String, InferenceError>>;

/// Pure model API. No state, no history, no context management.
/// Request in, fragments out.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start a streamed generation. Errors here happen before any fragment
    /// was produced and are safe to retry when transient.
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, InferenceError>;

    async fn generate_images(
        &self,
        _request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, InferenceError> {
        Err(InferenceError::ApiError {
            status: 501,
            body: "image generation not supported by this backend".into(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        Ok(Vec::new())
    }
}

/// Blanket impl so `Box<dyn GenerationBackend>` can be passed where a backend is expected.
#[async_trait]
impl GenerationBackend for Box<dyn GenerationBackend> {
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, InferenceError> {
        (**self).generate(request).await
    }

    async fn generate_images(
        &self,
        request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, InferenceError> {
        (**self).generate_images(request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        (**self).list_models().await
    }
}

pub use gemini::GeminiBackend;
pub use retry::{generate_with_retry, RetryPolicy};
