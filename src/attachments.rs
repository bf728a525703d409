use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AttachmentError, TransportError};
use crate::types::Part;

pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/heic", "image/heif", "image/webp"];
const AUDIO_TYPES: &[&str] = &[
    "audio/wav",
    "audio/mp3",
    "audio/aiff",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
];
const TEXT_TYPES: &[&str] = &["text/plain", "application/json", "text/markdown"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/mpeg", "video/quicktime"];

const UTF8_BOM: &str = "\u{feff}";

/// A file attached to an inbound chat message. Implemented by the platform
/// adapter; the payload is only fetched once the metadata checks pass.
#[async_trait]
pub trait Attachment: Send + Sync {
    fn filename(&self) -> &str;

    /// Declared MIME type, possibly with parameters (`text/plain; charset=utf-8`).
    fn content_type(&self) -> Option<&str>;

    /// Declared size in bytes.
    fn size(&self) -> u64;

    async fn read(&self) -> Result<Vec<u8>, TransportError>;
}

/// Attachment whose bytes are already in memory.
#[derive(Debug, Clone)]
pub struct InlineAttachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl InlineAttachment {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: Some(content_type.into()),
            data: data.into(),
        }
    }
}

#[async_trait]
impl Attachment for InlineAttachment {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        Ok(self.data.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Media,
}

fn classify(base_type: &str) -> Option<Kind> {
    if TEXT_TYPES.contains(&base_type) {
        Some(Kind::Text)
    } else if [IMAGE_TYPES, AUDIO_TYPES, VIDEO_TYPES]
        .iter()
        .any(|list| list.contains(&base_type))
    {
        Some(Kind::Media)
    } else {
        None
    }
}

/// Validates attachments and turns them into message parts.
#[derive(Debug, Clone)]
pub struct AttachmentProcessor {
    max_bytes: u64,
}

impl Default for AttachmentProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTACHMENT_BYTES)
    }
}

impl AttachmentProcessor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Text files come back as `Part::Text`; everything else as
    /// `Part::Binary` tagged with the base MIME type.
    pub async fn process(&self, attachment: &dyn Attachment) -> Result<Part, AttachmentError> {
        let filename = attachment.filename().to_string();

        if attachment.size() >= self.max_bytes {
            return Err(AttachmentError::TooLarge {
                filename,
                limit_mb: self.max_bytes / (1024 * 1024),
            });
        }

        let declared = attachment.content_type().unwrap_or("");
        let base_type = declared
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let Some(kind) = classify(&base_type) else {
            return Err(AttachmentError::Unsupported {
                filename,
                content_type: if declared.is_empty() {
                    "unknown".into()
                } else {
                    declared.to_string()
                },
            });
        };

        let data = attachment.read().await.map_err(|e| AttachmentError::Read {
            filename: filename.clone(),
            reason: e.to_string(),
        })?;

        debug!(filename = %filename, content_type = %base_type, bytes = data.len(), "attachment accepted");
        match kind {
            Kind::Text => {
                let text = String::from_utf8(data).map_err(|_| AttachmentError::Undecodable {
                    filename: filename.clone(),
                })?;
                let text = text.strip_prefix(UTF8_BOM).map(str::to_string).unwrap_or(text);
                Ok(Part::Text(text))
            }
            Kind::Media => Ok(Part::Binary {
                mime_type: base_type,
                data,
            }),
        }
    }

    /// Process every attachment in order. A failure never stops the others.
    pub async fn process_all(
        &self,
        attachments: &[Box<dyn Attachment>],
    ) -> (Vec<Part>, Vec<AttachmentError>) {
        let mut parts = Vec::new();
        let mut errors = Vec::new();
        for attachment in attachments {
            match self.process(attachment.as_ref()).await {
                Ok(part) => parts.push(part),
                Err(e) => {
                    warn!(error = %e, "attachment rejected");
                    errors.push(e);
                }
            }
        }
        (parts, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl Attachment for Unreachable {
        fn filename(&self) -> &str {
            "gone.png"
        }
        fn content_type(&self) -> Option<&str> {
            Some("image/png")
        }
        fn size(&self) -> u64 {
            10
        }
        async fn read(&self) -> Result<Vec<u8>, TransportError> {
            Err(TransportError("404".into()))
        }
    }

    #[tokio::test]
    async fn text_files_become_text_parts() {
        let processor = AttachmentProcessor::default();
        let file = InlineAttachment::new("notes.md", "text/markdown; charset=utf-8", "# title");
        assert_eq!(processor.process(&file).await.unwrap(), Part::text("# title"));
    }

    #[tokio::test]
    async fn byte_order_mark_is_stripped() {
        let processor = AttachmentProcessor::default();
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice(b"{\"a\": 1}");
        let file = InlineAttachment::new("data.json", "application/json", data);
        assert_eq!(processor.process(&file).await.unwrap(), Part::text("{\"a\": 1}"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_rejected() {
        let processor = AttachmentProcessor::default();
        let file = InlineAttachment::new("bad.txt", "text/plain", vec![0xff, 0xfe, 0x00]);
        assert!(matches!(
            processor.process(&file).await,
            Err(AttachmentError::Undecodable { .. })
        ));
    }

    #[tokio::test]
    async fn media_keeps_base_mime_type() {
        let processor = AttachmentProcessor::default();
        let file = InlineAttachment::new("a.ogg", "audio/ogg; codecs=opus", vec![1, 2, 3]);
        assert_eq!(
            processor.process(&file).await.unwrap(),
            Part::binary("audio/ogg", vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn size_limit_is_inclusive() {
        let processor = AttachmentProcessor::new(4);
        let file = InlineAttachment::new("big.png", "image/png", vec![0; 4]);
        assert!(matches!(
            processor.process(&file).await,
            Err(AttachmentError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn batch_collects_errors_and_keeps_going() {
        let processor = AttachmentProcessor::default();
        let attachments: Vec<Box<dyn Attachment>> = vec![
            Box::new(InlineAttachment::new("a.exe", "application/octet-stream", vec![0])),
            Box::new(Unreachable),
            Box::new(InlineAttachment::new("ok.txt", "text/plain", "fine")),
        ];

        let (parts, errors) = processor.process_all(&attachments).await;
        assert_eq!(parts, vec![Part::text("fine")]);
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], AttachmentError::Unsupported { .. }));
        assert!(matches!(errors[1], AttachmentError::Read { .. }));
    }
}
