use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ContextError;
use crate::store::{ContextSnapshot, ContextStore};
use crate::tokens::TokenCounter;
use crate::types::{
    ChannelId, Content, Message, Part, Role, StoredMessage, StoredPart, TEXT_PLAIN,
};

/// Which parts of a message are charged against the token budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAccounting {
    /// Only the first part is measured. Trailing attachments ride along for
    /// free, so a message with a large attachment is undercounted.
    #[default]
    FirstPart,
    /// Every part is measured and summed.
    AllParts,
}

/// Per-channel settings a context is opened with.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub system_prompt: String,
    pub model_name: String,
    pub token_budget: u32,
    pub accounting: TokenAccounting,
}

/// Result of one trimming pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimOutcome {
    pub evicted: usize,
    /// Only the system message is left and it alone exceeds the budget.
    pub over_budget: bool,
}

/// What a mutating operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub evicted: usize,
    pub over_budget: bool,
    /// False when the snapshot could not be written. The in-memory state is
    /// still updated.
    pub persisted: bool,
}

/// Settings and usage, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub system_prompt: String,
    pub model_name: String,
    pub token_budget: u32,
    pub total_tokens: u64,
    pub messages: usize,
}

/// The conversation history of one channel. Owns the message log and the
/// cached per-message token counts; the ONE place they are mutated.
///
/// Invariants held after every public call:
/// - `messages[0]` is the system message and is never evicted
/// - `token_counts.len() == messages.len()`
/// - `total_tokens == token_counts.iter().sum()`
/// - `total_tokens <= token_budget` unless only the system message remains
pub struct ChannelContext {
    channel: ChannelId,
    system_prompt: String,
    model_name: String,
    token_budget: u32,
    accounting: TokenAccounting,
    messages: Vec<StoredMessage>,
    token_counts: Vec<u32>,
    total_tokens: u64,
    counter: Arc<dyn TokenCounter>,
    store: Arc<dyn ContextStore>,
    closed: bool,
}

impl ChannelContext {
    /// Open the context for `channel`, restoring saved history when the store
    /// has any. Counts are always recomputed for the current model.
    pub async fn open(
        channel: ChannelId,
        settings: ContextSettings,
        counter: Arc<dyn TokenCounter>,
        store: Arc<dyn ContextStore>,
    ) -> Result<Self, ContextError> {
        if settings.token_budget == 0 {
            return Err(ContextError::InvalidBudget);
        }

        let loaded = match store.load(channel).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to load saved context, starting fresh");
                None
            }
        };

        let system = StoredMessage::system(&settings.system_prompt);
        let messages = match loaded {
            Some(snapshot) => {
                let legacy = !snapshot.has_counts();
                let mut messages = snapshot.messages;
                match messages.first() {
                    Some(first) if first.role == Role::System => messages[0] = system,
                    _ => messages.insert(0, system),
                }
                debug!(
                    channel = %channel,
                    messages = messages.len(),
                    legacy,
                    "restored saved context"
                );
                messages
            }
            None => vec![system],
        };

        let mut ctx = Self {
            channel,
            system_prompt: settings.system_prompt,
            model_name: settings.model_name,
            token_budget: settings.token_budget,
            accounting: settings.accounting,
            messages,
            token_counts: Vec::new(),
            total_tokens: 0,
            counter,
            store,
            closed: false,
        };

        ctx.token_counts = ctx.measure_all(&ctx.model_name).await?;
        ctx.recompute_total();

        let trim = ctx.trim();
        if trim.evicted > 0 {
            ctx.persist().await;
        }

        info!(
            channel = %channel,
            messages = ctx.messages.len(),
            total_tokens = ctx.total_tokens,
            budget = ctx.token_budget,
            "context opened"
        );
        Ok(ctx)
    }

    /// Append a message, trim to budget, persist.
    pub async fn add_message(
        &mut self,
        role: Role,
        content: impl Into<Content>,
    ) -> Result<Mutation, ContextError> {
        let parts: Vec<StoredPart> = content
            .into()
            .into_parts()
            .into_iter()
            .map(StoredPart::encode)
            .collect();
        let message = StoredMessage { role, parts };

        let cost = self.measure(&message, &self.model_name).await?;
        self.messages.push(message);
        self.token_counts.push(cost);
        self.total_tokens += u64::from(cost);

        debug!(
            channel = %self.channel,
            role = ?role,
            cost,
            total_tokens = self.total_tokens,
            "message added"
        );

        let trim = self.trim();
        Ok(self.finish(trim).await)
    }

    /// Evict the oldest non-system messages until the history fits the budget.
    pub fn trim(&mut self) -> TrimOutcome {
        let mut outcome = TrimOutcome::default();

        while self.total_tokens > u64::from(self.token_budget) {
            if self.messages.len() <= 1 {
                outcome.over_budget = true;
                warn!(
                    channel = %self.channel,
                    total_tokens = self.total_tokens,
                    budget = self.token_budget,
                    "system prompt alone exceeds the token budget"
                );
                break;
            }
            self.messages.remove(1);
            let cost = self.token_counts.remove(1);
            self.total_tokens -= u64::from(cost);
            outcome.evicted += 1;
        }

        if outcome.evicted > 0 {
            debug!(
                channel = %self.channel,
                evicted = outcome.evicted,
                total_tokens = self.total_tokens,
                "context trimmed"
            );
        }
        outcome
    }

    /// Drop everything but the system message.
    pub async fn clear(&mut self) -> Result<Mutation, ContextError> {
        let system = StoredMessage::system(&self.system_prompt);
        let cost = self.measure(&system, &self.model_name).await?;

        self.messages = vec![system];
        self.token_counts = vec![cost];
        self.recompute_total();

        info!(channel = %self.channel, "context cleared");
        let trim = self.trim();
        Ok(self.finish(trim).await)
    }

    pub async fn set_system_prompt(
        &mut self,
        prompt: impl Into<String>,
    ) -> Result<Mutation, ContextError> {
        let prompt = prompt.into();
        let system = StoredMessage::system(&prompt);
        let cost = self.measure(&system, &self.model_name).await?;

        let old = std::mem::replace(&mut self.token_counts[0], cost);
        self.messages[0] = system;
        self.system_prompt = prompt;
        self.total_tokens = self.total_tokens - u64::from(old) + u64::from(cost);

        let trim = self.trim();
        Ok(self.finish(trim).await)
    }

    /// Switch models. Every count is re-measured since counts are not
    /// portable across models.
    pub async fn set_model(&mut self, model: impl Into<String>) -> Result<Mutation, ContextError> {
        let model = model.into();
        let counts = self.measure_all(&model).await?;

        info!(channel = %self.channel, from = %self.model_name, to = %model, "model changed");
        self.model_name = model;
        self.token_counts = counts;
        self.recompute_total();

        let trim = self.trim();
        Ok(self.finish(trim).await)
    }

    pub async fn set_budget(&mut self, budget: u32) -> Result<Mutation, ContextError> {
        if budget == 0 {
            return Err(ContextError::InvalidBudget);
        }
        self.token_budget = budget;
        let trim = self.trim();
        Ok(self.finish(trim).await)
    }

    /// The history as the backend should see it: binary parts decoded back
    /// to bytes. A part that fails to decode is passed through as-is.
    pub fn get_context(&self) -> Vec<Message> {
        self.messages
            .iter()
            .map(|msg| Message {
                role: msg.role,
                parts: msg
                    .parts
                    .iter()
                    .map(|part| match part.decode() {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "failed to decode stored part");
                            match part {
                                StoredPart::Text(text) => Part::Text(text.clone()),
                                StoredPart::Inline { mime_type, data } => Part::Binary {
                                    mime_type: mime_type.clone(),
                                    data: data.clone().into_bytes(),
                                },
                            }
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Plain-text dump of the conversation, one paragraph per message.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            let role = msg.role.label();
            for part in &msg.parts {
                match part {
                    StoredPart::Text(text) => out.push_str(&format!("{role}: {text}\n")),
                    StoredPart::Inline { mime_type, data } if mime_type == TEXT_PLAIN => {
                        out.push_str(&format!("{role}: {data}\n"))
                    }
                    StoredPart::Inline { mime_type, .. } => {
                        out.push_str(&format!("{role}: File (Type: {mime_type})\n"))
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            system_prompt: self.system_prompt.clone(),
            model_name: self.model_name.clone(),
            token_budget: self.token_budget,
            total_tokens: self.total_tokens,
            messages: self.messages.len(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn token_budget(&self) -> u32 {
        self.token_budget
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn token_counts(&self) -> &[u32] {
        &self.token_counts
    }

    pub fn messages(&self) -> &[StoredMessage] {
        &self.messages
    }

    /// Stop persisting. Set when the channel is deactivated while a handle
    /// to this context is still held elsewhere.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            messages: self.messages.clone(),
            token_counts: self.token_counts.clone(),
            total_tokens: self.total_tokens,
            saved_at: Some(Utc::now()),
        }
    }

    async fn measure(&self, message: &StoredMessage, model: &str) -> Result<u32, ContextError> {
        let parts: &[StoredPart] = match self.accounting {
            TokenAccounting::FirstPart => {
                if message.parts.len() > 1 {
                    debug!(
                        channel = %self.channel,
                        uncounted_parts = message.parts.len() - 1,
                        "only the first part is charged to the budget"
                    );
                }
                &message.parts[..message.parts.len().min(1)]
            }
            TokenAccounting::AllParts => &message.parts,
        };

        let mut cost = 0u32;
        for part in parts {
            cost += self
                .counter
                .count(part.token_text(), model)
                .await
                .map_err(ContextError::TokenCount)?;
        }
        Ok(cost)
    }

    async fn measure_all(&self, model: &str) -> Result<Vec<u32>, ContextError> {
        let mut counts = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            counts.push(self.measure(msg, model).await?);
        }
        Ok(counts)
    }

    fn recompute_total(&mut self) {
        self.total_tokens = self.token_counts.iter().map(|&c| u64::from(c)).sum();
    }

    async fn finish(&mut self, trim: TrimOutcome) -> Mutation {
        let persisted = self.persist().await;
        Mutation {
            evicted: trim.evicted,
            over_budget: trim.over_budget,
            persisted,
        }
    }

    async fn persist(&self) -> bool {
        if self.closed {
            debug!(channel = %self.channel, "context closed, not saving");
            return false;
        }
        match self.store.save(self.channel, &self.snapshot()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "failed to persist context");
                false
            }
        }
    }
}
