use std::fmt;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::ChannelId;

/// Opaque id of a message the assistant sent, used for later edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub String);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outgoing side of the chat platform. The platform connection itself lives
/// outside this crate and implements this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, channel: ChannelId, content: &str) -> Result<MessageHandle, TransportError>;

    /// Replace the content of a message previously returned by `send`.
    async fn edit(
        &self,
        channel: ChannelId,
        handle: &MessageHandle,
        content: &str,
    ) -> Result<(), TransportError>;

    async fn delete(&self, channel: ChannelId, handle: &MessageHandle)
        -> Result<(), TransportError>;

    /// Upload a file, optionally with a caption.
    async fn send_file(
        &self,
        channel: ChannelId,
        filename: &str,
        data: &[u8],
        caption: Option<&str>,
    ) -> Result<(), TransportError>;
}
