use std::fmt::Display;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{FragmentStream, GenerationBackend};
use crate::error::InferenceError;
use crate::types::{
    GeneratedImage, GenerationRequest, ImageRequest, Message, ModelInfo, Part, Role,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const IMAGE_MODEL: &str = "imagen-3.0-generate-002";

/// Gemini via the Generative Language REST API. Text is streamed over SSE.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    image_model: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            image_model: IMAGE_MODEL.into(),
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

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{method}",
            self.base_url,
            model.trim_start_matches("models/")
        )
    }

    /// Build the `generateContent` body. System messages never go into
    /// `contents`; the prompt travels as `systemInstruction`.
    pub(crate) fn request_body(request: &GenerationRequest) -> Value {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(convert_message)
            .collect();

        let mut body = json!({ "contents": contents });
        if let Some(ref system) = request.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    async fn send_json(&self, url: String, body: &Value) -> Result<Value, InferenceError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        read_json(resp).await
    }
}

fn convert_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::Model => "model",
        _ => "user",
    };
    let parts: Vec<Value> = msg
        .parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => json!({ "text": text }),
            Part::Binary { mime_type, data } => json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": STANDARD.encode(data),
                }
            }),
        })
        .collect();
    json!({ "role": role, "parts": parts })
}

async fn read_json(resp: reqwest::Response) -> Result<Value, InferenceError> {
    let status = resp.status().as_u16();
    let text = resp
        .text()
        .await
        .map_err(|e| InferenceError::Request(e.to_string()))?;

    if status != 200 {
        return Err(InferenceError::ApiError { status, body: text });
    }
    serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))
}

/// Concatenated text of the first candidate in one streamed chunk.
fn chunk_text(chunk: &Value) -> Result<String, InferenceError> {
    if let Some(err) = chunk.get("error") {
        let status = err["code"].as_u64().unwrap_or(500) as u16;
        return Err(InferenceError::ApiError {
            status,
            body: err["message"].as_str().unwrap_or_default().to_string(),
        });
    }

    let parts = chunk["candidates"][0]["content"]["parts"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    Ok(parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<String>())
}

/// Text carried by one SSE event, or `None` for keep-alives and `[DONE]`.
fn event_text(data: &str) -> Result<Option<String>, InferenceError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let chunk: Value =
        serde_json::from_str(data).map_err(|e| InferenceError::Parse(e.to_string()))?;
    let text = chunk_text(&chunk)?;
    Ok((!text.is_empty()).then_some(text))
}

/// Turn a server-sent-events byte stream into text fragments. The stream
/// ends after the first error.
pub(crate) fn sse_fragments<S, B, E>(inner: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    inner
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) => event_text(&event.data).transpose(),
                Err(e) => Some(Err(InferenceError::Stream(e.to_string()))),
            }
        })
        .scan(false, |failed, item| {
            let next = if *failed {
                None
            } else {
                *failed = item.is_err();
                Some(item)
            };
            futures::future::ready(next)
        })
        .boxed()
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, InferenceError> {
        let body = Self::request_body(&request);

        debug!(
            model = %request.model,
            messages = body["contents"].as_array().map(|a| a.len()).unwrap_or(0),
            "gemini stream request"
        );

        let resp = self
            .client
            .post(self.model_url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::ApiError { status, body: text });
        }

        Ok(sse_fragments(resp.bytes_stream()))
    }

    async fn generate_images(
        &self,
        request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, InferenceError> {
        let mut parameters = json!({
            "sampleCount": request.count,
            "aspectRatio": request.aspect_ratio,
        });
        if let Some(ref negative) = request.negative_prompt {
            parameters["negativePrompt"] = json!(negative);
        }
        let body = json!({
            "instances": [{ "prompt": request.prompt }],
            "parameters": parameters,
        });

        let parsed = self
            .send_json(self.model_url(&self.image_model, "predict"), &body)
            .await?;

        let predictions = parsed["predictions"].as_array().cloned().unwrap_or_default();
        predictions
            .iter()
            .filter_map(|p| {
                let encoded = p["bytesBase64Encoded"].as_str()?;
                let mime_type = p["mimeType"].as_str().unwrap_or("image/png").to_string();
                Some(
                    STANDARD
                        .decode(encoded)
                        .map(|data| GeneratedImage { mime_type, data })
                        .map_err(|e| InferenceError::Parse(e.to_string())),
                )
            })
            .collect()
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(format!("{}/v1beta/models", self.base_url))
                .header("x-goog-api-key", &self.api_key);
            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token)]);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| InferenceError::Request(e.to_string()))?;
            let page: ModelList = serde_json::from_value(read_json(resp).await?)
                .map_err(|e| InferenceError::Parse(e.to_string()))?;

            models.extend(page.models);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(models)
    }
}
