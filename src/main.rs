//! lichstream - streaming ingestion core for GemStone IV behind Lich
//!
//! Parses the game's markup stream incrementally, routes content into
//! per-channel buffers and publishes metadata to subscribers.

mod config;
mod core;
mod data;
mod network;
mod parser;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::{EventBus, GameState, IngestStats, MessageProcessor};
use crate::data::{BufferManager, MAIN_CHANNEL};

#[derive(ClapParser)]
#[command(name = "lichstream")]
#[command(about = "Streaming markup ingestion for GemStone IV behind Lich", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Lich host (default from config: 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Port number to connect to (default from config: 8000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Character name for loading character-specific settings
    #[arg(long)]
    character: Option<String>,

    /// Custom data directory (default: ~/.lichstream)
    /// Can also be set via LICHSTREAM_DIR environment variable
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Lich and stream routed content to stdout (default)
    Connect,
    /// Feed a captured session through the pipeline and summarize it
    Replay {
        /// Captured raw stream
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Bytes per simulated network chunk
        #[arg(long, default_value_t = 512)]
        chunk_size: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging to file (use RUST_LOG env var to control level, e.g. RUST_LOG=debug)
    // stdout carries game text, so logs go to a file
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("lichstream.log")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false) // No color codes in log file
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Set custom data directory if specified (via CLI or environment variable)
    if let Some(data_dir) = &cli.data_dir {
        std::env::set_var(config::DIR_ENV, data_dir);
        tracing::info!("Using custom data directory: {:?}", data_dir);
    } else if let Ok(env_dir) = std::env::var(config::DIR_ENV) {
        tracing::info!("Using data directory from {}: {}", config::DIR_ENV, env_dir);
    }

    // Load configuration
    let character = cli.character.as_deref();
    let mut config = if let Some(config_path) = &cli.config {
        config::Config::load_from_path(config_path, character, cli.port)?
    } else {
        config::Config::load_with_options(character, cli.port)?
    };
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    let profile = config
        .character
        .as_deref()
        .or(config.connection.character.as_deref())
        .unwrap_or("default");
    tracing::info!("Using profile '{}'", profile);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = match cli.command.unwrap_or(Commands::Connect) {
        Commands::Connect => runtime.block_on(run_connect(config)),
        Commands::Replay {
            file,
            chunk_size,
            json,
        } => runtime.block_on(run_replay(config, &file, chunk_size, json)),
    };
    // Don't wait on the blocking stdin reader
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

/// Wires the shared pieces every mode needs
struct Pipeline {
    processor: MessageProcessor,
    buffers: Arc<BufferManager>,
    game_state: Arc<Mutex<GameState>>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    fn new(config: &config::Config) -> Self {
        let buffers = Arc::new(BufferManager::new(config.streams.buffer_size));
        let bus = Arc::new(EventBus::new());
        let game_state = Arc::new(Mutex::new(GameState::new()));
        let subscriptions = GameState::attach(Arc::clone(&game_state), &bus);
        tracing::debug!("Game state subscribed to {} topics", subscriptions.len());

        let (publisher, dispatcher) = bus.spawn_dispatcher();
        let processor = MessageProcessor::new(config, Arc::clone(&buffers), publisher);
        Self {
            processor,
            buffers,
            game_state,
            dispatcher,
        }
    }
}

async fn run_connect(config: config::Config) -> Result<()> {
    use tokio::io::AsyncBufReadExt;
    use tokio::sync::mpsc;

    let Pipeline {
        processor,
        buffers,
        game_state,
        dispatcher,
    } = Pipeline::new(&config);

    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();

    let ingest = tokio::spawn(processor.run(server_rx));

    // stdin lines become game commands
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if command_tx.send(line).is_err() {
                break;
            }
        }
    });

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let printer = {
        let buffers = Arc::clone(&buffers);
        tokio::spawn(async move {
            let mut seen = HashMap::new();
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = ticker.tick() => print_new_entries(&buffers, &mut seen),
                    _ = &mut stop_rx => break,
                }
            }
            // Whatever arrived after the last tick
            print_new_entries(&buffers, &mut seen);
        })
    };

    let connection = network::LichConnection::start(
        &config.connection.host,
        config.connection.port,
        server_tx,
        command_rx,
    )
    .await;

    let stats = ingest.await.context("Ingestion task failed")?;
    dispatcher.await.context("Event dispatcher failed")?;
    let _ = stop_tx.send(());
    printer.await.context("Output task failed")?;
    connection?;

    let state = game_state
        .lock()
        .map_err(|_| anyhow::anyhow!("game state lock poisoned"))?
        .clone();
    tracing::info!(
        "Session ended: {} bytes, {} duplicates dropped, last prompt {:?}",
        stats.bytes_received,
        stats.duplicates_dropped,
        state.last_prompt
    );
    Ok(())
}

/// Print entries appended since the last call, tagging non-main channels
fn print_new_entries(buffers: &BufferManager, seen: &mut HashMap<String, u64>) {
    for channel in buffers.channels() {
        let after = seen.get(&channel).copied().unwrap_or(0);
        let (entries, generation) = buffers.entries_since(&channel, after);
        seen.insert(channel.clone(), generation);

        for entry in entries {
            let text = entry.element.plain_text();
            if channel == MAIN_CHANNEL {
                print!("{}", text);
            } else {
                println!("[{}] {}", channel, text.trim_end());
            }
        }
    }
    let _ = std::io::stdout().flush();
}

#[derive(Serialize)]
struct ChannelSummary {
    channel: String,
    entries: usize,
    unread: usize,
    last: Option<String>,
}

#[derive(Serialize)]
struct ReplaySummary {
    stats: IngestStats,
    channels: Vec<ChannelSummary>,
    game_state: GameState,
}

async fn run_replay(config: config::Config, file: &Path, chunk_size: usize, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .context(format!("Failed to read session file: {:?}", file))?;

    let Pipeline {
        mut processor,
        buffers,
        game_state,
        dispatcher,
    } = Pipeline::new(&config);

    for chunk in network::split_into_chunks(&text, chunk_size) {
        processor.process_chunk(chunk);
    }
    processor.flush();
    let stats = processor.stats().clone();

    // Closing the publisher lets the dispatcher drain and stop
    drop(processor);
    dispatcher.await.context("Event dispatcher failed")?;

    let channels = buffers
        .channels()
        .into_iter()
        .map(|channel| {
            let entries = buffers.snapshot(&channel);
            ChannelSummary {
                entries: entries.len(),
                unread: buffers.unread_count(&channel),
                last: entries.last().map(|e| e.element.plain_text().trim().to_string()),
                channel,
            }
        })
        .collect();
    let game_state = game_state
        .lock()
        .map_err(|_| anyhow::anyhow!("game state lock poisoned"))?
        .clone();

    let summary = ReplaySummary {
        stats,
        channels,
        game_state,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &ReplaySummary) {
    let stats = &summary.stats;
    println!(
        "{} bytes in {} chunks: {} elements, {} publications, {} appends, {} duplicates dropped, {} parse errors ({:.2} ms parsing)",
        stats.bytes_received,
        stats.chunks,
        stats.elements_parsed,
        stats.publications,
        stats.appends,
        stats.duplicates_dropped,
        stats.parse_errors,
        stats.parse_time.as_secs_f64() * 1000.0
    );
    for channel in &summary.channels {
        println!(
            "  {:<14} {:>6} entries {:>6} unread  last: {}",
            channel.channel,
            channel.entries,
            channel.unread,
            channel.last.as_deref().unwrap_or("-")
        );
    }

    let state = &summary.game_state;
    println!(
        "  hands: {} / {}  spell: {}  prompt: {}",
        state.left_hand.as_deref().unwrap_or("empty"),
        state.right_hand.as_deref().unwrap_or("empty"),
        state.spell.as_deref().unwrap_or("none"),
        state.last_prompt
    );
    println!(
        "  health {}/{}  mana {}/{}  stamina {}/{}  spirit {}/{}",
        state.vitals.health.current,
        state.vitals.health.max,
        state.vitals.mana.current,
        state.vitals.mana.max,
        state.vitals.stamina.current,
        state.vitals.stamina.max,
        state.vitals.spirit.current,
        state.vitals.spirit.max
    );
}
