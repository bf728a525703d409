//! Console front-end for ruber-agent: one channel, you are the only user.
//!
//! Usage:
//!   GEMINI_API_KEY=... cargo run --example console
//!   cargo run --example console -- --offline
//!   cargo run --example console -- --name Alice --data-dir /tmp/ruber --log-level debug
//!
//! Commands work as in chat: `?activer`, `?info`, `?set_model gemini-1.5-pro`...
//! The channel is activated on start. Type "exit" / "quit" to leave.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use ruber_agent::streaming::ELLIPSIS;
use ruber_agent::{
    Assistant, AssistantConfig, ChannelId, Command, EstimatingTokenCounter, FragmentStream,
    GeminiBackend, GeminiTokenCounter, GenerationBackend, GenerationRequest, InboundMessage,
    InferenceError, MessageHandle, MessageOutcome, Part, TokenCounter, Transport, TransportError,
};

const CHANNEL: ChannelId = ChannelId(1);

#[derive(Parser)]
#[command(name = "console", about = "Talk to Ruber from the terminal")]
struct Cli {
    /// Display name sent with your messages
    #[arg(long, default_value = "User")]
    name: String,

    /// Model to use (overrides DEFAULT_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Where channel contexts are saved
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use a local echo backend even if GEMINI_API_KEY is set
    #[arg(long)]
    offline: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Prints messages as they stream in. Edits only ever extend the text the
/// assistant already showed, so only the new suffix is printed.
#[derive(Default)]
struct ConsoleTransport {
    shown: Mutex<HashMap<String, String>>,
    next: Mutex<u64>,
}

impl ConsoleTransport {
    fn show(&self, handle: &MessageHandle, content: &str) {
        let visible = content.strip_suffix(ELLIPSIS).unwrap_or(content);
        let Ok(mut shown) = self.shown.lock() else {
            return;
        };
        let previous = shown.entry(handle.0.clone()).or_default();
        match visible.strip_prefix(previous.as_str()) {
            Some(delta) => print!("{delta}"),
            None => print!("\n{visible}"),
        }
        io::stdout().flush().ok();
        *previous = visible.to_string();
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, _channel: ChannelId, content: &str) -> Result<MessageHandle, TransportError> {
        let id = {
            let mut next = self
                .next
                .lock()
                .map_err(|_| TransportError("console transport poisoned".into()))?;
            *next += 1;
            *next
        };
        let handle = MessageHandle(id.to_string());
        eprint!("\n\x1b[1;32mruber>\x1b[0m ");
        self.show(&handle, content);
        Ok(handle)
    }

    async fn edit(&self, _channel: ChannelId, handle: &MessageHandle, content: &str) -> Result<(), TransportError> {
        self.show(handle, content);
        Ok(())
    }

    async fn delete(&self, _channel: ChannelId, _handle: &MessageHandle) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_file(
        &self,
        _channel: ChannelId,
        filename: &str,
        data: &[u8],
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        std::fs::write(filename, data).map_err(|e| TransportError(e.to_string()))?;
        eprintln!(
            "\n\x1b[33m  [file saved: {filename}, {} bytes]\x1b[0m {}",
            data.len(),
            caption.unwrap_or("")
        );
        Ok(())
    }
}

/// Offline backend: repeats the last user message back, word by word.
struct EchoBackend;

#[async_trait]
impl GenerationBackend for EchoBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, InferenceError> {
        let last = request
            .messages
            .last()
            .and_then(|m| m.parts.first())
            .map(|p| match p {
                Part::Text(t) => t.clone(),
                Part::Binary { mime_type, .. } => format!("[{mime_type}]"),
            })
            .unwrap_or_default();
        let words: Vec<Result<String, InferenceError>> = format!("You said: {last}")
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures::stream::iter(words).boxed())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with_target(false)
        .init();

    let mut config = AssistantConfig::from_env();
    if let Some(model) = &cli.model {
        config.default_model = model.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.activation_file = dir.join("activated_channels.json");
        config.data_dir = dir.join("contexts");
    }

    let (backend, counter, label): (Arc<dyn GenerationBackend>, Arc<dyn TokenCounter>, &str) =
        match config.gemini_api_key.clone() {
            Some(key) if !cli.offline => (
                Arc::new(GeminiBackend::new(key.clone())),
                Arc::new(GeminiTokenCounter::new(key)),
                "gemini",
            ),
            _ => (Arc::new(EchoBackend), Arc::new(EstimatingTokenCounter), "echo (offline)"),
        };

    let model = config.default_model.clone();
    let prefix = config.command_prefix.clone();
    let assistant = Assistant::from_config(config, backend, Arc::new(ConsoleTransport::default()), counter);

    if let Err(e) = assistant.init().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    if !assistant.registry().is_active(CHANNEL).await {
        if let Err(e) = assistant.handle_command(CHANNEL, Command::Activate).await {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
        println!();
    }

    eprintln!("ruber console");
    eprintln!("backend: {label}");
    eprintln!("model: {model}");
    eprintln!("commands: {prefix}info, {prefix}clear, {prefix}set_model <name>, {prefix}download...");
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36m{}>\x1b[0m ", cli.name);
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        match assistant
            .handle_message(InboundMessage::new(CHANNEL, cli.name.clone(), trimmed))
            .await
        {
            Ok(MessageOutcome::Ignored(reason)) => {
                eprintln!("\x1b[2m  (ignored: {reason:?})\x1b[0m");
            }
            Ok(MessageOutcome::Replied(reply)) => {
                println!();
                eprintln!(
                    "\x1b[2m  [{} messages, {} edits]\x1b[0m",
                    reply.messages_sent, reply.edits
                );
            }
            Ok(_) => println!(),
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
    }

    eprintln!("bye.");
}
