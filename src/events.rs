use std::fmt;

use crate::attachments::Attachment;
use crate::streaming::AssembledReply;
use crate::types::ChannelId;

/// A chat message as delivered by the platform adapter.
pub struct InboundMessage {
    pub channel: ChannelId,
    /// Display name of the author, prefixed to the user turn.
    pub author: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Box<dyn Attachment>>,
}

impl InboundMessage {
    pub fn new(channel: ChannelId, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel,
            author: author.into(),
            author_is_bot: false,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn from_bot(mut self) -> Self {
        self.author_is_bot = true;
        self
    }

    pub fn with_attachment(mut self, attachment: impl Attachment + 'static) -> Self {
        self.attachments.push(Box::new(attachment));
        self
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("channel", &self.channel)
            .field("author", &self.author)
            .field("author_is_bot", &self.author_is_bot)
            .field("content", &self.content)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    FromBot,
    /// Starts with `(ignore)`.
    OptedOut,
    /// Starts with punctuation or another non-word character.
    NonWordStart,
    Inactive,
    /// Starts with the command prefix but names no known command.
    UnknownCommand,
}

/// What the assistant did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Ignored(IgnoreReason),
    /// The message was a command; any reply has already been sent.
    Command,
    Replied(AssembledReply),
    /// The reply was shown but could not be added to the context; the user
    /// was told.
    Unrecorded(AssembledReply),
    /// Generation failed; the user was told and the turn was not recorded.
    Failed,
}
