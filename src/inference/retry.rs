use std::time::Duration;

use tracing::{info, warn};

use super::{FragmentStream, GenerationBackend};
use crate::error::InferenceError;
use crate::types::GenerationRequest;

/// Fixed-bound, fixed-delay retry for starting a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Start a generation, retrying transient failures. Permanent errors are
/// returned immediately; after the last attempt the last error is returned.
///
/// Only the call that opens the stream is retried. Once fragments are flowing,
/// a failure belongs to the caller.
pub async fn generate_with_retry(
    backend: &dyn GenerationBackend,
    request: &GenerationRequest,
    policy: RetryPolicy,
) -> Result<FragmentStream, InferenceError> {
    let attempts = policy.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match backend.generate(request.clone()).await {
            Ok(stream) => {
                if attempt > 1 {
                    info!(attempt, "generation succeeded after retry");
                }
                return Ok(stream);
            }
            Err(e) if !e.is_transient() => {
                warn!(error = %e, "non-retryable generation error");
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!(attempts, error = %e, "all generation attempts exhausted");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_secs = policy.delay.as_secs_f64(),
                    error = %e,
                    "transient generation error, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedBackend {
        outcomes: Mutex<VecDeque<Result<Vec<&'static str>, InferenceError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedBackend {
        fn new(outcomes: Vec<Result<Vec<&'static str>, InferenceError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(&self, _: GenerationRequest) -> Result<FragmentStream, InferenceError> {
            *self.calls.lock().await += 1;
            let next = self
                .outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request("no more outcomes".into())))?;
            let items: Vec<Result<String, InferenceError>> =
                next.into_iter().map(|s| Ok(s.to_string())).collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "m".into(),
            system: None,
            messages: vec![],
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    fn server_error() -> InferenceError {
        InferenceError::ApiError {
            status: 500,
            body: "internal".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let backend = ScriptedBackend::new(vec![
            Err(server_error()),
            Err(server_error()),
            Ok(vec!["fine"]),
        ]);

        let stream = generate_with_retry(&backend, &request(), fast(3)).await.unwrap();
        let fragments: Vec<_> = stream.collect().await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_ref().unwrap(), "fine");
        assert_eq!(*backend.calls.lock().await, 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(InferenceError::ApiError {
                status: 400,
                body: "bad".into(),
            }),
            Ok(vec!["never"]),
        ]);

        let err = match generate_with_retry(&backend, &request(), fast(3)).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, InferenceError::ApiError { status: 400, .. }));
        assert_eq!(*backend.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn gives_up_after_the_bound() {
        let backend = ScriptedBackend::new(vec![
            Err(server_error()),
            Err(server_error()),
            Err(server_error()),
            Ok(vec!["too late"]),
        ]);

        assert!(generate_with_retry(&backend, &request(), fast(3)).await.is_err());
        assert_eq!(*backend.calls.lock().await, 3);
    }
}
