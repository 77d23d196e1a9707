mod settings;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chatsync_core::models::{Conversation, Message, SessionRegistry, StreamingSession};
use chatsync_core::repositories::{HttpRemoteStore, LocalStore, RemoteStore, SqliteLocalStore};
use chatsync_core::services::{
    GenerationGateway, HttpGenerationGateway, OptimisticWritePipeline, RegenerationMode,
    StreamDecoder, SyncService,
};
use chatsync_core::{GenerationController, GenerationEvent, ReactiveCache, RegenerateOptions};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::settings::repositories::sync_settings_json_repository::app_dir;
use crate::settings::{SyncSettings, SyncSettingsJsonRepository, SyncSettingsRepository};

#[derive(Parser)]
#[command(name = "chatsync", version, about = "Conversation sync and streaming client")]
struct Cli {
    /// Settings file (defaults to <config_dir>/chatsync/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the remote base URL
    #[arg(long, global = true)]
    remote_url: Option<String>,

    /// Override the generation endpoint URL
    #[arg(long, global = true)]
    gateway_url: Option<String>,

    /// Override the local database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the conversation list and print it
    Sync,
    /// Reconcile and print one conversation's messages
    Messages { conversation_id: String },
    /// Send a message and stream the reply
    Send {
        conversation_id: String,
        text: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Regenerate an assistant message in place
    Regenerate {
        conversation_id: String,
        message_id: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Retry)]
        mode: ModeArg,
        #[arg(long)]
        instruction: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Copy a conversation prefix into a new conversation
    Branch {
        conversation_id: String,
        message_id: String,
    },
    /// Replay a recorded stream file through the decoder
    Decode { file: PathBuf },
    /// Print the effective settings
    Config {
        /// Write them, overrides included, to the settings file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Retry,
    Concise,
    Detailed,
    Custom,
}

impl From<ModeArg> for RegenerationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Retry => RegenerationMode::Retry,
            ModeArg::Concise => RegenerationMode::Concise,
            ModeArg::Detailed => RegenerationMode::Detailed,
            ModeArg::Custom => RegenerationMode::Custom,
        }
    }
}

/// Everything a command needs, wired to the SQLite store and HTTP endpoints.
struct Engine {
    pipeline: Arc<OptimisticWritePipeline>,
    sync: SyncService,
    controller: GenerationController,
    default_model_id: Option<String>,
}

impl Engine {
    async fn open(settings: &SyncSettings) -> Result<Self> {
        let database_path = settings.database_path_in(&app_dir()?);
        let local: Arc<dyn LocalStore> = Arc::new(
            SqliteLocalStore::open(&database_path)
                .await
                .with_context(|| format!("Failed to open {}", database_path.display()))?,
        );
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(
            settings.remote_base_url.clone(),
            settings.request_timeout(),
        )?);
        let gateway: Arc<dyn GenerationGateway> = Arc::new(HttpGenerationGateway::new(
            settings.gateway_url.clone(),
            settings.request_timeout(),
        )?);

        let cache = Arc::new(ReactiveCache::new());
        let sessions = Arc::new(SessionRegistry::new());
        let pipeline = Arc::new(OptimisticWritePipeline::new(
            local.clone(),
            remote.clone(),
            cache.clone(),
        ));
        let sync = SyncService::new(
            local,
            remote.clone(),
            cache,
            pipeline.clone(),
            sessions.clone(),
            settings.page_size,
        );
        let controller = GenerationController::new(pipeline.clone(), remote, gateway, sessions);

        Ok(Self {
            pipeline,
            sync,
            controller,
            default_model_id: settings.default_model_id.clone(),
        })
    }

    /// Stream the reply of the conversation's active session to stdout.
    async fn follow(&self, conversation_id: &str) -> Result<()> {
        let mut events = self.controller.subscribe();
        let mut printed = String::new();

        while self.controller.is_streaming(conversation_id) {
            match events.recv().await {
                Ok(GenerationEvent::TextDelta {
                    conversation_id: id,
                    ..
                }) if id == conversation_id => {
                    if let Some(session) = self.controller.session(conversation_id) {
                        let visible = session.live_visible_text();
                        if let Some(new_text) = visible.strip_prefix(printed.as_str()) {
                            print!("{new_text}");
                            let _ = std::io::stdout().flush();
                            printed = visible;
                        }
                    }
                }
                Ok(GenerationEvent::StreamEnded {
                    conversation_id: id,
                    ..
                }) if id == conversation_id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }

        let session = self
            .controller
            .wait(conversation_id)
            .await
            .context("Session disappeared")?;
        println!("{}", remaining_output(&session.visible_text(), &printed));
        print_session_summary(&session);

        self.pipeline.flush().await;
        Ok(())
    }
}

/// What still has to be written after `printed` to show `visible` in full.
/// Starts over on a new line when the final text no longer extends what was printed.
fn remaining_output(visible: &str, printed: &str) -> String {
    match visible.strip_prefix(printed) {
        Some(rest) => rest.to_string(),
        None => format!("\n{visible}"),
    }
}

fn print_conversation(conversation: &Conversation) {
    let last = conversation
        .last_message_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let star = if conversation.starred { "*" } else { " " };
    println!("{star} {}  {}  {}", conversation.id, last, conversation.title);
}

fn print_message(message: &Message) {
    let meta = message.meta();
    println!("[{}] {:?} {}", message.id, message.role, message.created_at.to_rfc3339());
    for segment in &meta.reasoning {
        println!("  (reasoning) {}", segment.text);
    }
    println!("  {}", message.visible_text());
}

fn print_session_summary(session: &StreamingSession) {
    if let Some(error) = &session.error {
        eprintln!("error: {error}");
    }
    if let Some(usage) = session.finish.as_ref().and_then(|f| f.usage.as_ref()) {
        eprintln!(
            "tokens: {} in / {} out ({} total)",
            usage.input_tokens,
            usage.output_tokens,
            usage.total_tokens()
        );
    }
}

fn settings_repository(cli: &Cli) -> Result<SyncSettingsJsonRepository> {
    Ok(match &cli.settings {
        Some(path) => SyncSettingsJsonRepository::at(path),
        None => SyncSettingsJsonRepository::new()?,
    })
}

async fn load_settings(cli: &Cli) -> Result<SyncSettings> {
    let repository = settings_repository(cli)?;
    let mut settings = repository
        .load()
        .await
        .with_context(|| format!("Failed to load {}", repository.file_path().display()))?;

    if let Some(url) = &cli.remote_url {
        settings.remote_base_url = url.clone();
    }
    if let Some(url) = &cli.gateway_url {
        settings.gateway_url = url.clone();
    }
    if let Some(path) = &cli.database {
        settings.database_path = Some(path.clone());
    }
    Ok(settings)
}

async fn decode_file(file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut decoder = StreamDecoder::new();
    let mut session = StreamingSession::new("decode", "decode");
    session.apply(&decoder.decode(&bytes));
    session.apply(&decoder.finish());

    for segment in session.reasoning_segments() {
        println!("(reasoning, {:?}) {}", segment.state, segment.text);
    }
    println!("{}", session.visible_text());
    print_session_summary(&session);
    if decoder.dropped_records() > 0 {
        eprintln!("dropped {} malformed records", decoder.dropped_records());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Decode { file } = &cli.command {
        return decode_file(file).await;
    }

    let settings = load_settings(&cli).await?;
    debug!(remote = %settings.remote_base_url, gateway = %settings.gateway_url, "Settings loaded");

    if let Command::Config { save } = &cli.command {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        if *save {
            let repository = settings_repository(&cli)?;
            repository.save(settings).await?;
            info!(path = %repository.file_path().display(), "Settings saved");
        }
        return Ok(());
    }

    let engine = Engine::open(&settings).await?;

    match cli.command {
        Command::Sync => {
            for conversation in engine.sync.sync_conversations().await? {
                print_conversation(&conversation);
            }
        }
        Command::Messages { conversation_id } => {
            for message in engine.sync.sync_messages(&conversation_id).await? {
                print_message(&message);
            }
        }
        Command::Send {
            conversation_id,
            text,
            model,
        } => {
            engine.sync.sync_conversations().await?;
            engine.sync.sync_messages(&conversation_id).await?;
            let ticket = engine
                .controller
                .send(&conversation_id, &text, model.or(engine.default_model_id.clone()))
                .await?;
            info!(message_id = %ticket.message_id, "Streaming reply");
            engine.follow(&conversation_id).await?;
        }
        Command::Regenerate {
            conversation_id,
            message_id,
            mode,
            instruction,
            model,
        } => {
            if matches!(mode, ModeArg::Custom) && instruction.is_none() {
                bail!("--mode custom needs --instruction");
            }
            engine.sync.sync_conversations().await?;
            engine.sync.sync_messages(&conversation_id).await?;
            let options = RegenerateOptions {
                mode: mode.into(),
                instruction,
                model_id: model,
            };
            engine.controller.regenerate(&message_id, options).await?;
            engine.follow(&conversation_id).await?;
        }
        Command::Branch {
            conversation_id,
            message_id,
        } => {
            engine.sync.sync_conversations().await?;
            engine.sync.sync_messages(&conversation_id).await?;
            let branch = engine.controller.branch_from(&message_id).await?;
            engine.pipeline.flush().await;
            print_conversation(&branch);
        }
        Command::Decode { .. } | Command::Config { .. } => {}
    }

    Ok(())
}
