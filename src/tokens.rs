use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::InferenceError;
use crate::inference::gemini::DEFAULT_BASE_URL;

/// Measures how many tokens a piece of text costs under a given model.
/// Counts are model-dependent and must not be reused across models.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count(&self, text: &str, model: &str) -> Result<u32, InferenceError>;
}

/// Estimate tokens for a plain string. Uses a chars/4 heuristic, good enough
/// when no remote counter is available.
pub fn estimate_str_tokens(s: &str) -> u32 {
    (s.chars().count() as u32).div_ceil(4)
}

/// Local, model-agnostic counter.
pub struct EstimatingTokenCounter;

#[async_trait]
impl TokenCounter for EstimatingTokenCounter {
    async fn count(&self, text: &str, _model: &str) -> Result<u32, InferenceError> {
        Ok(estimate_str_tokens(text))
    }
}

/// Exact counts from the Generative Language `countTokens` endpoint.
pub struct GeminiTokenCounter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiTokenCounter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: u32,
}

#[async_trait]
impl TokenCounter for GeminiTokenCounter {
    async fn count(&self, text: &str, model: &str) -> Result<u32, InferenceError> {
        if text.is_empty() {
            return Ok(0);
        }

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": text }] }],
        });

        let resp = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:countTokens",
                self.base_url,
                model.trim_start_matches("models/")
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if status != 200 {
            return Err(InferenceError::ApiError { status, body: text });
        }

        let parsed: CountTokensResponse =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;
        Ok(parsed.total_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_str_tokens(""), 0);
        assert_eq!(estimate_str_tokens("abc"), 1);
        assert_eq!(estimate_str_tokens("abcdefgh"), 2);
        assert_eq!(estimate_str_tokens("héllo"), 2);
    }

    #[tokio::test]
    async fn estimating_counter_ignores_model() {
        let counter = EstimatingTokenCounter;
        let a = counter.count("twelve chars", "m1").await.unwrap();
        let b = counter.count("twelve chars", "m2").await.unwrap();
        assert_eq!(a, 3);
        assert_eq!(a, b);
    }

    mod http {
        use super::*;
        use wiremock::matchers::{body_json, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn counts_come_from_the_server() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1beta/models/gemini-test:countTokens"))
                .and(header("x-goog-api-key", "k"))
                .and(body_json(json!({
                    "contents": [{"role": "user", "parts": [{"text": "hana: salut"}]}]
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalTokens": 7})))
                .expect(1)
                .mount(&server)
                .await;

            let counter = GeminiTokenCounter::new("k").with_base_url(server.uri());
            assert_eq!(counter.count("hana: salut", "models/gemini-test").await.unwrap(), 7);
            assert_eq!(counter.count("", "gemini-test").await.unwrap(), 0);
        }

        #[tokio::test]
        async fn empty_text_makes_no_request() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalTokens": 1})))
                .expect(0)
                .mount(&server)
                .await;

            let counter = GeminiTokenCounter::new("k").with_base_url(server.uri());
            assert_eq!(counter.count("", "gemini-test").await.unwrap(), 0);
        }

        #[tokio::test]
        async fn server_errors_are_api_errors() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(503).set_body_string("down"))
                .mount(&server)
                .await;

            let counter = GeminiTokenCounter::new("k").with_base_url(server.uri());
            let err = counter.count("hello", "gemini-test").await.unwrap_err();
            assert!(matches!(err, InferenceError::ApiError { status: 503, .. }));
            assert!(err.is_transient());
        }
    }
}
