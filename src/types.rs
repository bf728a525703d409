use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of a chat channel. One conversation context per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Model,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Model => "Model",
        }
    }
}

/// One unit of message content as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Binary { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Binary {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// A decoded message, ready for the generation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// What callers hand to `ChannelContext::add_message`.
#[derive(Debug, Clone)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Part>> for Content {
    fn from(parts: Vec<Part>) -> Self {
        Self::Parts(parts)
    }
}

impl Content {
    pub(crate) fn into_parts(self) -> Vec<Part> {
        match self {
            Self::Text(text) => vec![Part::Text(text)],
            Self::Parts(parts) => parts,
        }
    }
}

pub const TEXT_PLAIN: &str = "text/plain";

/// A part as it sits in the context file. Binary payloads are base64 text,
/// except `text/plain` which is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StoredPart {
    Text(String),
    Inline { mime_type: String, data: String },
}

// Older files also carry `{"text": "..."}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPart {
    Text(String),
    Inline { mime_type: String, data: String },
    TextObject { text: String },
}

impl<'de> Deserialize<'de> for StoredPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawPart::deserialize(deserializer)? {
            RawPart::Text(text) | RawPart::TextObject { text } => Self::Text(text),
            RawPart::Inline { mime_type, data } => Self::Inline { mime_type, data },
        })
    }
}

impl StoredPart {
    pub fn encode(part: Part) -> Self {
        match part {
            Part::Text(text) => Self::Text(text),
            Part::Binary { mime_type, data } if mime_type == TEXT_PLAIN => Self::Inline {
                mime_type,
                data: String::from_utf8_lossy(&data).into_owned(),
            },
            Part::Binary { mime_type, data } => Self::Inline {
                mime_type,
                data: STANDARD.encode(data),
            },
        }
    }

    pub fn decode(&self) -> Result<Part, base64::DecodeError> {
        match self {
            Self::Text(text) => Ok(Part::Text(text.clone())),
            Self::Inline { mime_type, data } if mime_type == TEXT_PLAIN => Ok(Part::Binary {
                mime_type: mime_type.clone(),
                data: data.clone().into_bytes(),
            }),
            Self::Inline { mime_type, data } => Ok(Part::Binary {
                mime_type: mime_type.clone(),
                data: STANDARD.decode(data)?,
            }),
        }
    }

    /// The text handed to the token counter for this part.
    pub fn token_text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Inline { data, .. } => data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub parts: Vec<StoredPart>,
}

impl StoredMessage {
    pub fn system(prompt: &str) -> Self {
        Self {
            role: Role::System,
            parts: vec![StoredPart::Text(prompt.to_string())],
        }
    }
}

/// Fully-formed generation request. The backend just sends it.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub negative_prompt: Option<String>,
    pub count: u32,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: "1:1".into(),
            negative_prompt: None,
            count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A model advertised by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_parts_are_base64_at_rest() {
        let stored = StoredPart::encode(Part::binary("image/png", vec![0u8, 1, 2, 255]));
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            json!({"mime_type": "image/png", "data": "AAEC/w=="})
        );
        assert_eq!(
            stored.decode().unwrap(),
            Part::binary("image/png", vec![0u8, 1, 2, 255])
        );
    }

    #[test]
    fn plain_text_blobs_are_kept_verbatim() {
        let stored = StoredPart::encode(Part::binary(TEXT_PLAIN, b"notes".to_vec()));
        assert_eq!(
            stored,
            StoredPart::Inline {
                mime_type: TEXT_PLAIN.into(),
                data: "notes".into()
            }
        );
    }

    #[test]
    fn legacy_text_objects_load_as_text() {
        let msg: StoredMessage = serde_json::from_value(json!({
            "role": "user",
            "parts": ["hi", {"text": "there"}, {"mime_type": "audio/ogg", "data": "AA=="}]
        }))
        .unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.parts[0], StoredPart::Text("hi".into()));
        assert_eq!(msg.parts[1], StoredPart::Text("there".into()));
        assert!(matches!(msg.parts[2], StoredPart::Inline { .. }));
    }

    #[test]
    fn text_serializes_as_bare_string() {
        let msg = StoredMessage::system("be nice");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "system", "parts": ["be nice"]})
        );
    }
}
