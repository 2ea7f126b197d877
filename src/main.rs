/*
 * Channel Ingest CLI - Rust Edition
 * Copyright (c) 2025 Channel Ingest Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_ingest_rs::acquire::AudioAcquirer;
use channel_ingest_rs::asr::whisper::WhisperRunner;
use channel_ingest_rs::asr::TranscribeEngine;
use channel_ingest_rs::config::Config;
use channel_ingest_rs::embed::EmbeddingClient;
use channel_ingest_rs::model_pool::ModelPool;
use channel_ingest_rs::orchestrator::Orchestrator;
use channel_ingest_rs::sources::{
    LocalWalkerSource, UrlListSource, VideoSource, YoutubeChannelSource,
};
use channel_ingest_rs::stats::IngestionStats;
use channel_ingest_rs::store::Store;
use channel_ingest_rs::types::{FailureKind, IngestionSummary, SourceType};
use channel_ingest_rs::voices::VoiceProfileStore;

const EXIT_OK: i32 = 0;
const EXIT_PARTIAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_ENVIRONMENT: i32 = 3;
const EXIT_CANCELLED: i32 = 130;

/// Channel Ingest CLI - speaker-attributed transcript ingestion for RAG
#[derive(Parser)]
#[command(name = "channel-ingest")]
#[command(version = "0.1.0")]
#[command(about = "Ingest long-form spoken video into a speaker-attributed, embedded transcript store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline over a channel, URL list, or directory
    Ingest {
        /// Source type: youtube or local
        #[arg(long, default_value = "youtube")]
        source: SourceType,

        /// Channel URL to list (youtube source)
        #[arg(long)]
        channel: Option<String>,

        /// Explicit video URLs (repeatable; youtube source)
        #[arg(long)]
        url: Vec<String>,

        /// Directory of media files (local source)
        #[arg(long)]
        paths: Option<PathBuf>,

        /// Stop after N videos from the listing
        #[arg(long)]
        limit: Option<usize>,

        /// Directory of enrolled voice profiles
        #[arg(long)]
        voices_dir: Option<PathBuf>,

        /// Use manual captions instead of ASR when available
        /// (forbidden with speaker identification)
        #[arg(long)]
        allow_external_captions: bool,

        /// Never take the monologue fast path
        #[arg(long)]
        force_full_asr: bool,

        /// Abort the whole run on the first task failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Probe the environment: database, tools, models, voice profiles
    Status,

    /// Voice profile management
    Voices {
        #[command(subcommand)]
        command: VoicesCommand,
    },
}

#[derive(Subcommand)]
enum VoicesCommand {
    /// List enrolled profiles
    List {
        #[arg(long)]
        voices_dir: Option<PathBuf>,
    },
}

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return EXIT_ENVIRONMENT;
        }
    };

    match cli.command {
        Commands::Ingest {
            source,
            channel,
            url,
            paths,
            limit,
            voices_dir,
            allow_external_captions,
            force_full_asr,
            fail_fast,
        } => runtime.block_on(run_ingest(IngestArgs {
            source,
            channel,
            url,
            paths,
            limit,
            voices_dir,
            allow_external_captions,
            force_full_asr,
            fail_fast,
        })),
        Commands::Status => runtime.block_on(run_status()),
        Commands::Voices { command } => match command {
            VoicesCommand::List { voices_dir } => run_voices_list(voices_dir),
        },
    }
}

struct IngestArgs {
    source: SourceType,
    channel: Option<String>,
    url: Vec<String>,
    paths: Option<PathBuf>,
    limit: Option<usize>,
    voices_dir: Option<PathBuf>,
    allow_external_captions: bool,
    force_full_asr: bool,
    fail_fast: bool,
}

async fn run_ingest(args: IngestArgs) -> i32 {
    // Configuration is read once, overridden by flags, validated, frozen.
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "configuration error:".red());
            return EXIT_CONFIG;
        }
    };
    config.source_type = args.source;
    if let Some(dir) = &args.voices_dir {
        config.voices_dir = dir.clone();
    }
    // Deliberately does not switch speaker ID off: the combination is a
    // policy violation and validation rejects it below.
    if args.allow_external_captions {
        config.speaker.allow_external_captions = true;
    }
    if args.force_full_asr {
        config.speaker.force_full_asr = true;
    }
    if args.fail_fast {
        config.fail_fast = true;
    }

    if let Err(e) = config.validate() {
        eprintln!("{} {e}", "configuration error:".red());
        return EXIT_CONFIG;
    }

    init_tracing();

    // Fatal environment checks before any work starts.
    let profiles = if config.speaker.enable_speaker_id {
        match VoiceProfileStore::load(&config.voices_dir, &config.speaker.host_profile_name) {
            Ok(store) => {
                if let Err(e) = store.require_host() {
                    eprintln!("{} {e}", "environment error:".red());
                    return EXIT_ENVIRONMENT;
                }
                tracing::info!(
                    "loaded {} voice profiles (version {})",
                    store.profile_count(),
                    store.version()
                );
                Arc::new(store)
            }
            Err(e) => {
                eprintln!("{} {e:#}", "environment error:".red());
                return EXIT_ENVIRONMENT;
            }
        }
    } else {
        Arc::new(VoiceProfileStore::disabled())
    };

    let store = match Store::connect(&config).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("{} {e}", "environment error:".red());
            return EXIT_ENVIRONMENT;
        }
    };
    if let Err(e) = store.ensure_schema().await {
        eprintln!("{} {e}", "environment error:".red());
        return EXIT_ENVIRONMENT;
    }

    let runner = match WhisperRunner::detect(config.asr.command.clone(), config.asr.word_timestamps).await
    {
        Some(runner) => runner,
        None => {
            eprintln!(
                "{} no transcriber CLI found (tried whisper-ctranslate2, faster-whisper, whisper); \
                 install one or set INGEST_ASR_COMMAND",
                "environment error:".red()
            );
            return EXIT_ENVIRONMENT;
        }
    };
    tracing::info!("transcriber backend: {}", runner.command());

    let source: Box<dyn VideoSource> = match build_source(&args, &config) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} {e:#}", "configuration error:".red());
            return EXIT_CONFIG;
        }
    };
    tracing::info!("video source: {}", source.describe());

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received, draining in-flight work...");
                interrupted.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }

    let local_root = args.paths.clone();
    let pool = ModelPool::new(&config);
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(store),
        pool,
        Arc::new(AudioAcquirer::new(&config, local_root)),
        Arc::new(TranscribeEngine::new(&config, runner)),
        Arc::new(EmbeddingClient::new(&config.embedding)),
        profiles,
        IngestionStats::new(),
        cancel.clone(),
    );

    let summary = orchestrator.run(source).await;
    print_summary(&summary);

    if interrupted.load(Ordering::SeqCst) {
        EXIT_CANCELLED
    } else if summary.failed > 0 {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

fn build_source(args: &IngestArgs, config: &Config) -> Result<Box<dyn VideoSource>> {
    match config.source_type {
        SourceType::Youtube => {
            if !args.url.is_empty() {
                Ok(Box::new(UrlListSource::new(&args.url)?))
            } else if let Some(channel) = &args.channel {
                Ok(Box::new(YoutubeChannelSource::new(channel.clone(), args.limit)))
            } else {
                anyhow::bail!("youtube source needs --channel or at least one --url");
            }
        }
        SourceType::Local => {
            let root = args
                .paths
                .clone()
                .ok_or_else(|| anyhow::anyhow!("local source needs --paths <dir>"))?;
            Ok(Box::new(LocalWalkerSource::new(root)))
        }
    }
}

async fn run_status() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "configuration error:".red());
            return EXIT_CONFIG;
        }
    };

    println!("{}", "Channel Ingest - Environment Status".bold());
    println!();

    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_message("probing environment...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let db_status = match Store::connect(&config).await {
        Ok(_) => "reachable".green().to_string(),
        Err(e) => format!("{} ({e})", "unreachable".red()),
    };
    let ytdlp = command_available("yt-dlp").await;
    let ffmpeg = command_available("ffmpeg").await;
    let whisper =
        WhisperRunner::detect(config.asr.command.clone(), config.asr.word_timestamps).await;

    let voices = VoiceProfileStore::load(&config.voices_dir, &config.speaker.host_profile_name);
    spinner.finish_and_clear();

    println!("   Database:       {db_status}");
    println!("   yt-dlp:         {}", tool_status(ytdlp));
    println!("   ffmpeg:         {}", tool_status(ffmpeg));
    println!(
        "   Transcriber:    {}",
        match &whisper {
            Some(runner) => runner.command().green().to_string(),
            None => "not found".red().to_string(),
        }
    );
    match &voices {
        Ok(store) => {
            let host = if store.host.is_some() { "host enrolled".green() } else { "no host".yellow() };
            println!(
                "   Voice profiles: {} ({} total, version {})",
                host,
                store.profile_count(),
                store.version()
            );
        }
        Err(e) => println!("   Voice profiles: {} ({e:#})", "unreadable".red()),
    }
    println!();
    println!("   ASR model:       {} ({})", config.asr.model_identifier, config.asr.compute_precision);
    println!(
        "   Embedding model: {} (D={}, batch {})",
        config.embedding.model_identifier, config.embedding.dimension, config.embedding.batch_size
    );
    println!(
        "   Workers:         io={} asr={} embed={} db={}",
        config.runtime.io_workers,
        config.runtime.asr_workers,
        config.runtime.embed_workers,
        config.runtime.db_workers
    );
    println!(
        "   VRAM budget:     {} MiB",
        config.runtime.vram_budget_bytes / (1024 * 1024)
    );

    EXIT_OK
}

fn run_voices_list(voices_dir: Option<PathBuf>) -> i32 {
    let dir = voices_dir.unwrap_or_else(|| {
        Config::load().map(|c| c.voices_dir).unwrap_or_else(|_| PathBuf::from("voices"))
    });

    match VoiceProfileStore::load(&dir, "host") {
        Ok(store) => {
            println!("{}", format!("Voice profiles in {} (version {})", dir.display(), store.version()).bold());
            match &store.host {
                Some(host) => println!(
                    "   {} {} ({} samples)",
                    "HOST ".green(),
                    host.name,
                    host.sample_count
                ),
                None => println!("   {} none enrolled", "HOST ".yellow()),
            }
            for guest in &store.guests {
                println!("   {} {} ({} samples)", "GUEST".blue(), guest.name, guest.sample_count);
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            EXIT_ENVIRONMENT
        }
    }
}

fn print_summary(summary: &IngestionSummary) {
    println!();
    println!("{}", "Ingestion Summary".bold());
    println!("   Attempted: {}", summary.attempted);
    println!("   Persisted: {}", summary.persisted.to_string().green());
    println!("   Skipped:   {}", summary.skipped);
    if summary.failed > 0 {
        println!("   Failed:    {}", summary.failed.to_string().red());
    } else {
        println!("   Failed:    0");
    }
    if summary.cancelled > 0 {
        println!("   Cancelled: {}", summary.cancelled.to_string().yellow());
    }
    println!("   Segments committed:  {}", summary.segments_committed);
    println!("   Duplicates removed:  {}", summary.duplicates_removed);
    if summary.media_seconds_processed > 0.0 {
        println!(
            "   Media processed:     {:.1} min (rtf {:.2})",
            summary.media_seconds_processed / 60.0,
            summary.real_time_factor()
        );
    }

    for kind in [
        FailureKind::Acquisition,
        FailureKind::Model,
        FailureKind::Optimizer,
        FailureKind::Commit,
        FailureKind::Internal,
    ] {
        if let Some(count) = summary.failures_by_kind.get(&kind) {
            println!("   {} failures: {count}", kind);
            if let Some(examples) = summary.representative_errors.get(&kind) {
                for example in examples {
                    println!("      - {example}");
                }
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".channel-ingest")
        .join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "ingest.log");

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("channel_ingest_rs=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::fmt::layer().with_writer(file_appender).with_ansi(false))
        .init();
}

async fn command_available(command: &str) -> bool {
    tokio::process::Command::new(command)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn tool_status(available: bool) -> String {
    if available {
        "available".green().to_string()
    } else {
        "missing".red().to_string()
    }
}
