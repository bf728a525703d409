use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::AssistantError;
use crate::inference::FragmentStream;
use crate::transport::{MessageHandle, Transport};
use crate::types::ChannelId;

/// Provisional suffix shown while a message is still being written.
pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Hard length limit of one outgoing message, in characters.
    pub message_limit: usize,
    /// Minimum delay between two updates.
    pub update_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            message_limit: 2000,
            update_interval: Duration::from_millis(500),
        }
    }
}

/// Result of streaming one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledReply {
    /// Every fragment, concatenated. This is what gets recorded as the
    /// model's turn.
    pub text: String,
    pub messages_sent: usize,
    pub edits: usize,
}

/// Maps a stream of fragments onto a sequence of bounded-length chat
/// messages, editing the newest one in place as text arrives.
pub struct ReplyAssembler<'a> {
    transport: &'a dyn Transport,
    channel: ChannelId,
    config: StreamConfig,
    reply: AssembledReply,
}

impl<'a> ReplyAssembler<'a> {
    pub fn new(transport: &'a dyn Transport, channel: ChannelId, config: StreamConfig) -> Self {
        Self {
            transport,
            channel,
            config,
            reply: AssembledReply::default(),
        }
    }

    /// Room left for text once the provisional suffix is accounted for.
    fn budget(&self) -> usize {
        self.config
            .message_limit
            .saturating_sub(ELLIPSIS.chars().count())
            .max(1)
    }

    /// Drive the stream to completion. On a mid-stream error the partial
    /// output is finalized and the error returned; the caller decides what
    /// the user sees.
    pub async fn run(mut self, mut fragments: FragmentStream) -> Result<AssembledReply, AssistantError> {
        let budget = self.budget();
        let mut buffer = String::new();
        let mut active: Option<MessageHandle> = None;

        while let Some(item) = fragments.next().await {
            let fragment = match item {
                Ok(f) => f,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "reply stream failed");
                    self.abandon(active.take(), &buffer).await;
                    return Err(e.into());
                }
            };
            if fragment.is_empty() {
                continue;
            }
            self.reply.text.push_str(&fragment);

            if let Some(handle) = active.take() {
                if char_len(&buffer) + char_len(&fragment) > budget {
                    debug!(channel = %self.channel, "fragment would overflow, starting a new message");
                    self.finalize(&handle, &buffer).await?;
                    active = Some(self.send(ELLIPSIS).await?);
                    buffer.clear();
                } else {
                    active = Some(handle);
                }
            }

            buffer.push_str(&fragment);

            match active.take() {
                Some(handle) if char_len(&buffer) <= budget => {
                    self.edit(&handle, &format!("{buffer}{ELLIPSIS}")).await?;
                    active = Some(handle);
                }
                Some(handle) => {
                    self.finalize(&handle, &buffer).await?;
                    buffer.clear();
                }
                None if char_len(&buffer) <= budget => {
                    active = Some(self.send(&format!("{buffer}{ELLIPSIS}")).await?);
                }
                None => {
                    self.send_chunks(&buffer).await?;
                    buffer.clear();
                }
            }

            if !self.config.update_interval.is_zero() {
                tokio::time::sleep(self.config.update_interval).await;
            }
        }

        match active {
            Some(handle) => self.finalize(&handle, &buffer).await?,
            None if !buffer.is_empty() => self.send_chunks(&buffer).await?,
            None => {}
        }

        debug!(
            channel = %self.channel,
            chars = char_len(&self.reply.text),
            messages = self.reply.messages_sent,
            edits = self.reply.edits,
            "reply assembled"
        );
        Ok(self.reply)
    }

    async fn send(&mut self, content: &str) -> Result<MessageHandle, AssistantError> {
        let handle = self.transport.send(self.channel, content).await?;
        self.reply.messages_sent += 1;
        Ok(handle)
    }

    async fn edit(&mut self, handle: &MessageHandle, content: &str) -> Result<(), AssistantError> {
        self.transport.edit(self.channel, handle, content).await?;
        self.reply.edits += 1;
        Ok(())
    }

    /// Give `handle` its final content. Content past the limit spills into
    /// new messages; an empty buffer removes the placeholder.
    async fn finalize(&mut self, handle: &MessageHandle, buffer: &str) -> Result<(), AssistantError> {
        let mut chunks = split_chunks(buffer, self.config.message_limit).into_iter();
        match chunks.next() {
            Some(first) => self.edit(handle, &first).await?,
            None => self.transport.delete(self.channel, handle).await?,
        }
        for chunk in chunks {
            self.send(&chunk).await?;
        }
        Ok(())
    }

    async fn send_chunks(&mut self, text: &str) -> Result<(), AssistantError> {
        for chunk in split_chunks(text, self.config.message_limit) {
            self.send(&chunk).await?;
        }
        Ok(())
    }

    async fn abandon(&mut self, active: Option<MessageHandle>, buffer: &str) {
        if let Some(handle) = active {
            if let Err(e) = self.finalize(&handle, buffer).await {
                warn!(channel = %self.channel, error = %e, "failed to finalize partial reply");
            }
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into pieces of at most `limit` characters, on char boundaries.
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::transport::recording::RecordingTransport;

    fn fragments(items: Vec<Result<&str, InferenceError>>) -> FragmentStream {
        let owned: Vec<Result<String, InferenceError>> =
            items.into_iter().map(|r| r.map(String::from)).collect();
        futures::stream::iter(owned).boxed()
    }

    fn config(limit: usize) -> StreamConfig {
        StreamConfig {
            message_limit: limit,
            update_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn long_reply_spans_several_messages() {
        let transport = RecordingTransport::default();
        let assembler = ReplyAssembler::new(&transport, ChannelId(1), config(20));

        let reply = assembler
            .run(fragments(vec![
                Ok("Hello "),
                Ok("world, "),
                Ok("this is a long reply..."),
            ]))
            .await
            .unwrap();

        assert_eq!(reply.text, "Hello world, this is a long reply...");
        assert!(transport.edits() >= 2);
        let contents = transport.contents();
        assert!(contents.len() >= 2);
        assert!(contents.iter().all(|c| c.chars().count() <= 20));
        assert_eq!(contents.concat(), reply.text);
        assert_eq!(contents[0], "Hello world, ");
    }

    #[tokio::test]
    async fn short_reply_is_one_message_without_ellipsis() {
        let transport = RecordingTransport::default();
        let reply = ReplyAssembler::new(&transport, ChannelId(1), config(2000))
            .run(fragments(vec![Ok("Bonjour"), Ok(", "), Ok("Ruber ici.")]))
            .await
            .unwrap();

        assert_eq!(transport.contents(), vec!["Bonjour, Ruber ici.".to_string()]);
        assert_eq!(reply.messages_sent, 1);
        assert_eq!(reply.edits, 3);
    }

    #[tokio::test]
    async fn empty_stream_sends_nothing() {
        let transport = RecordingTransport::default();
        let reply = ReplyAssembler::new(&transport, ChannelId(1), config(20))
            .run(fragments(vec![Ok("")]))
            .await
            .unwrap();

        assert!(transport.contents().is_empty());
        assert_eq!(reply, AssembledReply::default());
    }

    #[tokio::test]
    async fn single_oversized_fragment_is_split() {
        let transport = RecordingTransport::default();
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let reply = ReplyAssembler::new(&transport, ChannelId(1), config(10))
            .run(fragments(vec![Ok(text)]))
            .await
            .unwrap();

        let contents = transport.contents();
        assert_eq!(contents.concat(), text);
        assert_eq!(contents.len(), 4);
        assert_eq!(reply.text, text);
    }

    #[tokio::test]
    async fn no_message_ever_exceeds_the_limit() {
        let transport = RecordingTransport::default();
        let words: Vec<Result<&str, InferenceError>> =
            std::iter::repeat(Ok("lorem ipsum ")).take(50).collect();
        let reply = ReplyAssembler::new(&transport, ChannelId(1), config(30))
            .run(fragments(words))
            .await
            .unwrap();

        let contents = transport.contents();
        assert!(contents.iter().all(|c| c.chars().count() <= 30));
        assert!(contents.iter().all(|c| !c.ends_with(ELLIPSIS)));
        assert_eq!(contents.concat(), reply.text);
    }

    #[tokio::test]
    async fn mid_stream_error_finalizes_partial_output() {
        let transport = RecordingTransport::default();
        let err = ReplyAssembler::new(&transport, ChannelId(1), config(2000))
            .run(fragments(vec![
                Ok("half a "),
                Err(InferenceError::Stream("reset".into())),
                Ok("never seen"),
            ]))
            .await
            .unwrap_err();

        assert!(matches!(err, AssistantError::Inference(InferenceError::Stream(_))));
        assert_eq!(transport.contents(), vec!["half a ".to_string()]);
    }

    #[test]
    fn split_respects_char_boundaries() {
        assert_eq!(split_chunks("ééé", 2), vec!["éé".to_string(), "é".to_string()]);
        assert!(split_chunks("", 5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn updates_wait_for_the_interval() {
        let transport = RecordingTransport::default();
        let interval = Duration::from_millis(500);
        let assembler = ReplyAssembler::new(
            &transport,
            ChannelId(1),
            StreamConfig {
                message_limit: 2000,
                update_interval: interval,
            },
        );

        let start = tokio::time::Instant::now();
        let reply = assembler
            .run(fragments(vec![Ok("one "), Ok("two "), Ok("three")]))
            .await
            .unwrap();

        assert_eq!(reply.text, "one two three");
        assert!(start.elapsed() >= interval * 3);
        assert_eq!(transport.contents(), vec!["one two three".to_string()]);
    }
}
