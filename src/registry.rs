use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::context::{ChannelContext, ContextSettings};
use crate::error::{ContextError, PersistenceError};
use crate::store::{write_atomic, ContextStore};
use crate::tokens::TokenCounter;
use crate::types::ChannelId;

/// Shared handle to one channel's context. Hold the lock for a whole turn.
pub type SharedContext = Arc<Mutex<ChannelContext>>;

/// Which channels the assistant is active in, and their live contexts.
///
/// The activation set is written to `activation_file` after every change.
/// Contexts are opened lazily on first use and dropped on deactivation.
pub struct SessionRegistry {
    activation_file: PathBuf,
    defaults: ContextSettings,
    counter: Arc<dyn TokenCounter>,
    store: Arc<dyn ContextStore>,
    purge_on_deactivate: bool,
    active: RwLock<HashSet<ChannelId>>,
    contexts: RwLock<HashMap<ChannelId, SharedContext>>,
}

impl SessionRegistry {
    pub fn new(
        activation_file: impl Into<PathBuf>,
        defaults: ContextSettings,
        counter: Arc<dyn TokenCounter>,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            activation_file: activation_file.into(),
            defaults,
            counter,
            store,
            purge_on_deactivate: false,
            active: RwLock::new(HashSet::new()),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Also delete the saved history when a channel is deactivated.
    pub fn with_purge_on_deactivate(mut self, purge: bool) -> Self {
        self.purge_on_deactivate = purge;
        self
    }

    pub fn defaults(&self) -> &ContextSettings {
        &self.defaults
    }

    pub fn activation_file(&self) -> &Path {
        &self.activation_file
    }

    /// Load the activation set from disk. A missing file means no channel
    /// is active; an unreadable one is logged and treated the same way.
    pub async fn init(&self) -> Result<usize, PersistenceError> {
        let loaded: Vec<ChannelId> = match tokio::fs::read_to_string(&self.activation_file).await {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(
                        path = %self.activation_file.display(),
                        error = %e,
                        "activation file is corrupt, starting with no active channels"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut active = self.active.write().await;
        active.extend(loaded);
        info!(channels = active.len(), "activation registry loaded");
        Ok(active.len())
    }

    pub async fn is_active(&self, channel: ChannelId) -> bool {
        self.active.read().await.contains(&channel)
    }

    pub async fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.active.read().await.iter().copied().collect();
        channels.sort();
        channels
    }

    /// Open the context of `channel` and mark it active. The channel stays
    /// inactive when the context cannot be opened.
    pub async fn activate(&self, channel: ChannelId) -> Result<SharedContext, ContextError> {
        let ctx = self.open(channel).await?;
        let inserted = self.active.write().await.insert(channel);
        if inserted {
            info!(channel = %channel, "channel activated");
            self.save_activation().await;
        }
        Ok(ctx)
    }

    /// Returns false when the channel was not active. Waits for a turn in
    /// progress, then closes the context so nothing writes it again.
    pub async fn deactivate(&self, channel: ChannelId) -> bool {
        if !self.active.write().await.remove(&channel) {
            return false;
        }
        let removed = self.contexts.write().await.remove(&channel);
        self.save_activation().await;

        if let Some(ctx) = removed {
            ctx.lock().await.close();
        }
        if self.purge_on_deactivate {
            if let Err(e) = self.store.remove(channel).await {
                warn!(channel = %channel, error = %e, "failed to purge saved context");
            }
        }
        info!(channel = %channel, purged = self.purge_on_deactivate, "channel deactivated");
        true
    }

    /// The context of an active channel, opened on first access. `None` when
    /// the channel is not active.
    pub async fn context(&self, channel: ChannelId) -> Result<Option<SharedContext>, ContextError> {
        if !self.is_active(channel).await {
            return Ok(None);
        }
        self.open(channel).await.map(Some)
    }

    async fn open(&self, channel: ChannelId) -> Result<SharedContext, ContextError> {
        if let Some(ctx) = self.contexts.read().await.get(&channel) {
            return Ok(Arc::clone(ctx));
        }

        // Opened outside the lock; token counting may hit the network.
        let opened = ChannelContext::open(
            channel,
            self.defaults.clone(),
            Arc::clone(&self.counter),
            Arc::clone(&self.store),
        )
        .await?;

        let mut contexts = self.contexts.write().await;
        let ctx = contexts
            .entry(channel)
            .or_insert_with(|| Arc::new(Mutex::new(opened)));
        debug!(channel = %channel, "context ready");
        Ok(Arc::clone(ctx))
    }

    async fn save_activation(&self) {
        let ids = self.active_channels().await;
        let result = match serde_json::to_vec(&ids) {
            Ok(json) => write_atomic(&self.activation_file, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(
                path = %self.activation_file.display(),
                error = %e,
                "failed to save activation registry"
            );
        }
    }
}
