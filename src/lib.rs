pub mod attachments;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod inference;
pub mod registry;
pub mod store;
pub mod streaming;
pub mod tokens;
pub mod transport;
pub mod types;

use std::sync::Arc;

use tracing::{debug, info, warn};

pub use attachments::{Attachment, AttachmentProcessor, InlineAttachment};
pub use commands::Command;
pub use config::AssistantConfig;
pub use context::{ChannelContext, ContextInfo, ContextSettings, Mutation, TokenAccounting};
pub use error::{
    AssistantError, AttachmentError, CommandError, ContextError, InferenceError, PersistenceError,
    TransportError,
};
pub use events::{IgnoreReason, InboundMessage, MessageOutcome};
pub use inference::{generate_with_retry, FragmentStream, GeminiBackend, GenerationBackend, RetryPolicy};
pub use registry::{SessionRegistry, SharedContext};
pub use store::{ContextSnapshot, ContextStore, FileContextStore, NoContextStore};
pub use streaming::{AssembledReply, ReplyAssembler, StreamConfig};
pub use tokens::{EstimatingTokenCounter, GeminiTokenCounter, TokenCounter};
pub use transport::{MessageHandle, Transport};
pub use types::{ChannelId, GenerationRequest, ImageRequest, Message, Part, Role};

const NOT_ACTIVE: &str = "The assistant is not active in this channel.";

/// The assistant. Wire up a backend, a transport, and a session registry,
/// then feed it inbound messages.
pub struct Assistant {
    backend: Arc<dyn GenerationBackend>,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    attachments: AttachmentProcessor,
    config: AssistantConfig,
}

impl Assistant {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        config: AssistantConfig,
    ) -> Self {
        Self {
            backend,
            transport,
            registry,
            attachments: AttachmentProcessor::new(config.max_attachment_bytes),
            config,
        }
    }

    /// Build the registry from `config`: one file per channel under
    /// `data_dir`, activation set in `activation_file`.
    pub fn from_config(
        config: AssistantConfig,
        backend: Arc<dyn GenerationBackend>,
        transport: Arc<dyn Transport>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let store = Arc::new(FileContextStore::new(config.data_dir.clone()));
        let registry = SessionRegistry::new(
            config.activation_file.clone(),
            config.context_settings(),
            counter,
            store,
        )
        .with_purge_on_deactivate(config.purge_on_deactivate);
        Self::new(backend, transport, Arc::new(registry), config)
    }

    /// Load the activation set. Call once before handling messages.
    pub async fn init(&self) -> Result<usize, AssistantError> {
        Ok(self.registry.init().await?)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// Route one inbound message: commands are executed, ordinary messages in
    /// active channels get a streamed reply.
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<MessageOutcome, AssistantError> {
        if msg.author_is_bot {
            return Ok(MessageOutcome::Ignored(IgnoreReason::FromBot));
        }

        match Command::parse(&msg.content, &self.config.command_prefix) {
            Some(Ok(command)) => {
                self.handle_command(msg.channel, command).await?;
                return Ok(MessageOutcome::Command);
            }
            Some(Err(CommandError::Unknown(name))) => {
                debug!(channel = %msg.channel, command = %name, "unknown command, ignoring");
                return Ok(MessageOutcome::Ignored(IgnoreReason::UnknownCommand));
            }
            Some(Err(e)) => {
                debug!(channel = %msg.channel, error = %e, "rejected command");
                self.transport
                    .send(msg.channel, &format!("Command error: {e}"))
                    .await?;
                return Ok(MessageOutcome::Command);
            }
            None => {}
        }

        if let Some(reason) = ignore_reason(&msg.content) {
            debug!(channel = %msg.channel, ?reason, "message ignored");
            return Ok(MessageOutcome::Ignored(reason));
        }

        let ctx = match self.registry.context(msg.channel).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return Ok(MessageOutcome::Ignored(IgnoreReason::Inactive)),
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "failed to open context");
                self.report_context_error(msg.channel, &e).await?;
                return Ok(MessageOutcome::Failed);
            }
        };
        // Held for the whole turn so replies in one channel never interleave.
        let mut ctx = ctx.lock().await;
        if ctx.is_closed() {
            return Ok(MessageOutcome::Ignored(IgnoreReason::Inactive));
        }

        let (extra, errors) = self.attachments.process_all(&msg.attachments).await;
        if !errors.is_empty() {
            let lines: Vec<String> = errors.iter().map(ToString::to_string).collect();
            self.transport
                .send(
                    msg.channel,
                    &format!("Some attachments could not be processed:\n{}", lines.join("\n")),
                )
                .await?;
        }
        let parts = user_parts(&msg.author, &msg.content, extra);

        if let Err(e) = ctx.add_message(Role::User, parts).await {
            warn!(channel = %msg.channel, error = %e, "failed to record user message");
            self.report_context_error(msg.channel, &e).await?;
            return Ok(MessageOutcome::Failed);
        }

        let request = GenerationRequest {
            model: ctx.model_name().to_string(),
            system: Some(ctx.system_prompt().to_string()),
            messages: ctx.get_context(),
        };
        let stream = match generate_with_retry(self.backend.as_ref(), &request, self.config.retry).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_inference_error(msg.channel, &e).await?;
                return Ok(MessageOutcome::Failed);
            }
        };

        let assembler =
            ReplyAssembler::new(self.transport.as_ref(), msg.channel, self.config.stream_config());
        let reply = match assembler.run(stream).await {
            Ok(reply) => reply,
            Err(AssistantError::Inference(e)) => {
                self.report_inference_error(msg.channel, &e).await?;
                return Ok(MessageOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        if reply.text.is_empty() {
            warn!(channel = %msg.channel, "model returned an empty reply, not recording it");
        } else if let Err(e) = ctx.add_message(Role::Model, reply.text.as_str()).await {
            warn!(channel = %msg.channel, error = %e, "failed to record model reply");
            self.report_context_error(msg.channel, &e).await?;
            return Ok(MessageOutcome::Unrecorded(reply));
        }

        info!(
            channel = %msg.channel,
            messages = reply.messages_sent,
            total_tokens = ctx.total_tokens(),
            "turn complete"
        );
        Ok(MessageOutcome::Replied(reply))
    }

    /// Execute a command in `channel` and send its confirmation.
    pub async fn handle_command(&self, channel: ChannelId, command: Command) -> Result<(), AssistantError> {
        info!(channel = %channel, ?command, "command");
        match command {
            Command::Activate => {
                let ctx = match self.registry.activate(channel).await {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "activation failed");
                        return self.report_context_error(channel, &e).await;
                    }
                };
                let ctx = ctx.lock().await;
                self.say(
                    channel,
                    &format!(
                        "Assistant activated in this channel. Context initialized with system prompt: '{}'. Model: {}",
                        ctx.system_prompt(),
                        ctx.model_name()
                    ),
                )
                .await
            }
            Command::Deactivate => {
                let text = if self.registry.deactivate(channel).await {
                    "Assistant deactivated in this channel."
                } else {
                    "The assistant was not active in this channel."
                };
                self.say(channel, text).await
            }
            Command::Clear => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let result = ctx.lock().await.clear().await;
                match result {
                    Ok(_) => self.say(channel, "Context cleared.").await,
                    Err(e) => self.report_context_error(channel, &e).await,
                }
            }
            Command::Download => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let transcript = ctx.lock().await.transcript();
                self.transport
                    .send_file(channel, "context.txt", transcript.as_bytes(), None)
                    .await?;
                Ok(())
            }
            Command::SetSystemPrompt(prompt) => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let result = ctx.lock().await.set_system_prompt(prompt.as_str()).await;
                match result {
                    Ok(_) => {
                        self.say(channel, &format!("System prompt updated for this channel: '{prompt}'"))
                            .await
                    }
                    Err(e) => self.report_context_error(channel, &e).await,
                }
            }
            Command::SetContextSize(size) => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let result = ctx.lock().await.set_budget(size).await;
                match result {
                    Ok(_) => {
                        self.say(
                            channel,
                            &format!("Maximum context size updated for this channel: {size} tokens."),
                        )
                        .await
                    }
                    Err(e) => self.report_context_error(channel, &e).await,
                }
            }
            Command::SetModel(model) => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let result = ctx.lock().await.set_model(model.as_str()).await;
                match result {
                    Ok(_) => self.say(channel, &format!("Model updated for this channel: {model}")).await,
                    Err(e) => self.report_context_error(channel, &e).await,
                }
            }
            Command::Info => {
                let Some(ctx) = self.active_context(channel).await? else {
                    return Ok(());
                };
                let info = ctx.lock().await.info();
                self.say(
                    channel,
                    &format!(
                        "Settings used by Ruber in this channel:\n- System prompt: {}\n- Model: {}\n- Context size: {} tokens\n- Tokens in use: {} across {} messages",
                        info.system_prompt, info.model_name, info.token_budget, info.total_tokens, info.messages
                    ),
                )
                .await
            }
            Command::Imagen(request) => self.generate_images(channel, request).await,
            Command::ListModels => self.list_models(channel).await,
        }
    }

    async fn generate_images(&self, channel: ChannelId, request: ImageRequest) -> Result<(), AssistantError> {
        self.say(channel, "Generating image...").await?;
        let images = match self.backend.generate_images(request).await {
            Ok(images) => images,
            Err(e) => {
                warn!(channel = %channel, error = %e, "image generation failed");
                return self
                    .say(channel, &format!("Image generation failed: {}", e.user_message()))
                    .await;
            }
        };

        if images.is_empty() {
            return self.say(channel, "The model did not return any image.").await;
        }
        let total = images.len();
        for (i, image) in images.iter().enumerate() {
            let ext = image_extension(&image.mime_type);
            if total > 1 {
                let caption = format!("Image {} of {total}:", i + 1);
                self.transport
                    .send_file(channel, &format!("image_{}.{ext}", i + 1), &image.data, Some(&caption))
                    .await?;
            } else {
                self.transport
                    .send_file(channel, &format!("image.{ext}"), &image.data, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn list_models(&self, channel: ChannelId) -> Result<(), AssistantError> {
        let models = match self.backend.list_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!(channel = %channel, error = %e, "listing models failed");
                return self
                    .say(channel, &format!("Could not list models: {}", e.user_message()))
                    .await;
            }
        };

        let mut text = String::from("Available models:\n");
        for model in &models {
            text.push_str(&format!("- **{}**\n", model.name));
            text.push_str(&format!("  - Description: {}\n", model.description));
            text.push_str(&format!(
                "  - Supported methods: {}\n",
                model.supported_generation_methods.join(", ")
            ));
        }
        for chunk in streaming::split_chunks(&text, self.config.message_limit) {
            self.transport.send(channel, &chunk).await?;
        }
        Ok(())
    }

    /// The context of `channel`, or `None` once the user has been told why
    /// there is none.
    async fn active_context(&self, channel: ChannelId) -> Result<Option<SharedContext>, AssistantError> {
        match self.registry.context(channel).await {
            Ok(Some(ctx)) => Ok(Some(ctx)),
            Ok(None) => {
                self.say(channel, NOT_ACTIVE).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to open context");
                self.report_context_error(channel, &e).await?;
                Ok(None)
            }
        }
    }

    async fn say(&self, channel: ChannelId, text: &str) -> Result<(), AssistantError> {
        self.transport.send(channel, text).await?;
        Ok(())
    }

    async fn report_inference_error(&self, channel: ChannelId, e: &InferenceError) -> Result<(), AssistantError> {
        warn!(channel = %channel, error = %e, "generation failed");
        self.say(channel, &format!("An error occurred: {}", e.user_message()))
            .await
    }

    async fn report_context_error(&self, channel: ChannelId, e: &ContextError) -> Result<(), AssistantError> {
        match e {
            ContextError::TokenCount(inner) => self.report_inference_error(channel, inner).await,
            ContextError::InvalidBudget => self.say(channel, &format!("An error occurred: {e}")).await,
        }
    }
}

/// Why an ordinary (non-command) message should not get a reply, judged on
/// its text alone.
fn ignore_reason(content: &str) -> Option<IgnoreReason> {
    if content
        .get(..8)
        .is_some_and(|head| head.eq_ignore_ascii_case("(ignore)"))
    {
        return Some(IgnoreReason::OptedOut);
    }
    match content.chars().next() {
        Some(c) if !(c.is_alphanumeric() || c == '_') => Some(IgnoreReason::NonWordStart),
        _ => None,
    }
}

/// The user turn: `"<author>: <content>"` first, decoded text attachments
/// appended to it, binary attachments after.
fn user_parts(author: &str, content: &str, attachments: Vec<Part>) -> Vec<Part> {
    let mut text = format!("{author}: {content}");
    let mut binaries = Vec::new();
    for part in attachments {
        match part {
            Part::Text(extra) => {
                text.push('\n');
                text.push_str(&extra);
            }
            binary => binaries.push(binary),
        }
    }
    let mut parts = vec![Part::Text(text)];
    parts.extend(binaries);
    parts
}

fn image_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}
