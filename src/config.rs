use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::attachments::DEFAULT_MAX_ATTACHMENT_BYTES;
use crate::context::{ContextSettings, TokenAccounting};
use crate::inference::RetryPolicy;
use crate::streaming::StreamConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Your name is Ruber and you are a humanoid robot invented by PseudoRouge. \
You understand and answer the messages users send you. \
User messages reach you with the sender's display name first, then a colon, then the message itself. For example: 'User A: Hello!'. \
You are not supposed to imitate this format; answer as naturally as you can.";

/// Assistant configuration.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub gemini_api_key: Option<String>,
    pub default_model: String,
    /// Token budget given to newly opened channels.
    pub default_context_size: u32,
    pub default_system_prompt: String,
    /// Directory holding one `<channel>.json` per channel.
    pub data_dir: PathBuf,
    pub activation_file: PathBuf,
    pub command_prefix: String,
    pub message_limit: usize,
    pub update_interval: Duration,
    pub retry: RetryPolicy,
    pub max_attachment_bytes: u64,
    pub token_accounting: TokenAccounting,
    /// Delete a channel's saved history when it is deactivated.
    pub purge_on_deactivate: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            default_model: "gemini-exp-1206".into(),
            default_context_size: 2_097_152,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            data_dir: PathBuf::from("contexts"),
            activation_file: PathBuf::from("activated_channels.json"),
            command_prefix: "?".into(),
            message_limit: 2000,
            update_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            token_accounting: TokenAccounting::FirstPart,
            purge_on_deactivate: false,
        }
    }
}

impl AssistantConfig {
    /// Defaults overridden by the process environment. A `.env` file in the
    /// working directory is loaded first and wins over variables already set.
    pub fn from_env() -> Self {
        match dotenvy::dotenv_override() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => warn!(error = %e, "ignoring unreadable .env"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads `path` without touching the
    /// process environment. Keys in the file take precedence.
    pub fn from_env_file(path: &Path) -> Result<Self, dotenvy::Error> {
        let file = dotenvy::from_path_iter(path)?.collect::<Result<HashMap<String, String>, _>>()?;
        Ok(Self::from_lookup(|key| {
            file.get(key).cloned().or_else(|| std::env::var(key).ok())
        }))
    }

    /// Defaults overridden by whatever `lookup` returns. Values that fail to
    /// parse are logged and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.gemini_api_key = get("GEMINI_API_KEY");
        if let Some(model) = get("DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Some(size) = get("DEFAULT_CONTEXT_SIZE") {
            match parse_positive::<u32>(&size) {
                Some(n) => config.default_context_size = n,
                None => warn!(key = "DEFAULT_CONTEXT_SIZE", value = %size, "invalid value, keeping default"),
            }
        }
        if let Some(prompt) = get("DEFAULT_SYSTEM_PROMPT") {
            config.default_system_prompt = prompt;
        }
        if let Some(dir) = get("RUBER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = get("RUBER_ACTIVATION_FILE") {
            config.activation_file = PathBuf::from(file);
        }
        if let Some(prefix) = get("RUBER_COMMAND_PREFIX") {
            config.command_prefix = prefix.trim().to_string();
        }
        if let Some(mode) = get("RUBER_TOKEN_ACCOUNTING") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "first_part" => config.token_accounting = TokenAccounting::FirstPart,
                "all_parts" => config.token_accounting = TokenAccounting::AllParts,
                _ => warn!(key = "RUBER_TOKEN_ACCOUNTING", value = %mode, "invalid value, keeping default"),
            }
        }
        config
    }

    /// Settings a newly opened channel starts with.
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            system_prompt: self.default_system_prompt.clone(),
            model_name: self.default_model.clone(),
            token_budget: self.default_context_size,
            accounting: self.token_accounting,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            message_limit: self.message_limit,
            update_interval: self.update_interval,
        }
    }
}

fn parse_positive<T: FromStr + Default + PartialOrd>(value: &str) -> Option<T> {
    value.trim().parse::<T>().ok().filter(|n| *n > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = AssistantConfig::from_lookup(|_| None);
        assert_eq!(config.default_model, "gemini-exp-1206");
        assert_eq!(config.default_context_size, 2_097_152);
        assert_eq!(config.command_prefix, "?");
        assert_eq!(config.token_accounting, TokenAccounting::FirstPart);
        assert!(config.gemini_api_key.is_none());
        assert!(config.default_system_prompt.starts_with("Your name is Ruber"));
    }

    #[test]
    fn environment_overrides() {
        let config = AssistantConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "secret"),
            ("DEFAULT_MODEL", "gemini-1.5-pro"),
            ("DEFAULT_CONTEXT_SIZE", "32768"),
            ("RUBER_DATA_DIR", "/var/lib/ruber"),
            ("RUBER_COMMAND_PREFIX", "!"),
            ("RUBER_TOKEN_ACCOUNTING", "all_parts"),
        ]));
        assert_eq!(config.gemini_api_key.as_deref(), Some("secret"));
        assert_eq!(config.default_model, "gemini-1.5-pro");
        assert_eq!(config.default_context_size, 32768);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ruber"));
        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.token_accounting, TokenAccounting::AllParts);

        let settings = config.context_settings();
        assert_eq!(settings.token_budget, 32768);
        assert_eq!(settings.model_name, "gemini-1.5-pro");
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = AssistantConfig::from_lookup(lookup(&[
            ("DEFAULT_CONTEXT_SIZE", "huge"),
            ("RUBER_TOKEN_ACCOUNTING", "everything"),
            ("DEFAULT_MODEL", "   "),
        ]));
        assert_eq!(config.default_context_size, 2_097_152);
        assert_eq!(config.token_accounting, TokenAccounting::FirstPart);
        assert_eq!(config.default_model, "gemini-exp-1206");
        assert!(AssistantConfig::from_lookup(lookup(&[("DEFAULT_CONTEXT_SIZE", "0")]))
            .default_context_size
            > 0);
    }

    #[test]
    fn env_file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# ruber\nDEFAULT_CONTEXT_SIZE=4096\nRUBER_COMMAND_PREFIX=\"!\"\n",
        )
        .unwrap();

        let config = AssistantConfig::from_env_file(&path).unwrap();
        assert_eq!(config.default_context_size, 4096);
        assert_eq!(config.command_prefix, "!");
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AssistantConfig::from_env_file(&dir.path().join(".env")).unwrap_err();
        assert!(err.not_found());
    }
}
