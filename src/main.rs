use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};

use stt_relay::config::Config;
use stt_relay::pipeline::{resummarize, DrainRunner, PollOutcome, RelayWorker};
use stt_relay::queue::{entry, Job, QueueError, TaskQueue};
use stt_relay::sink::DirSink;
use stt_relay::storage::{StorageError, WebdavStore};
use stt_relay::summarize::{DispatchStatus, Multiplexer};
use stt_relay::transcribe::CommandTranscriber;
use stt_relay::utils::logger;

const EXIT_STORAGE: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_EMPTY: u8 = 4;

#[derive(Parser)]
#[command(name = "stt-relay")]
#[command(about = "Video transcription queue over shared WebDAV storage")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(long, default_value = "stt-relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put media on the queue: one local file, or a scraped listing
    Enqueue {
        /// Local media file to upload
        file: Option<PathBuf>,
        /// Job id (defaults to the file stem)
        #[arg(long)]
        id: Option<String>,
        /// Media length in seconds, so workers can pick by length
        #[arg(long)]
        duration: Option<f64>,
        /// Language hint for the engine
        #[arg(long)]
        language: Option<String>,
        /// Title carried through to the summary
        #[arg(long)]
        title: Option<String>,
        /// JSON-lines listing, one video per line
        #[arg(long, conflicts_with_all = ["file", "id", "duration", "title"])]
        manifest: Option<PathBuf>,
        /// Where media for manifest entries lives, as {id}.{ext}
        #[arg(long, default_value = "./media", requires = "manifest")]
        media_dir: PathBuf,
    },
    /// Claim and transcribe pending media
    Worker {
        /// One poll instead of the loop
        #[arg(long)]
        once: bool,
    },
    /// Collect finished transcripts, summarize, write them out
    Drain {
        /// One pass instead of the loop
        #[arg(long)]
        once: bool,
    },
    /// Probe storage and every summary provider
    Check,
    /// Backfill summaries for transcripts delivered without one
    Resummarize,
    /// Show queue depths
    Status,
    /// Delete media and transcript blobs no entry references
    Gc,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let _guard = match logger::init("./logs") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logger init failed: {e:#}");
            return ExitCode::from(1);
        }
    };
    info!("stt-relay {} starting", stt_relay::GIT_HASH);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(classify(&e))
        }
    }
}

/// Storage trouble and credential trouble get their own exit codes so
/// cron wrappers can tell "server is down" from "fix your password".
fn classify(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<StorageError>() {
            return match e {
                StorageError::Auth => EXIT_AUTH,
                _ => EXIT_STORAGE,
            };
        }
    }
    1
}

async fn run(cli: Cli) -> Result<u8> {
    let cfg = Config::load(&cli.config)?;
    let queue = build_queue(&cfg)?;

    match cli.command {
        Commands::Enqueue {
            file,
            id,
            duration,
            language,
            title,
            manifest,
            media_dir,
        } => {
            queue.init().await?;
            match (file, manifest) {
                (Some(file), None) => {
                    cmd_enqueue_file(&queue, &file, id, duration, language, title).await?;
                    Ok(0)
                }
                (None, Some(manifest)) => {
                    let added =
                        cmd_enqueue_manifest(&queue, &manifest, &media_dir, language).await?;
                    info!("queued {added} new jobs");
                    Ok(0)
                }
                _ => bail!("pass a media file or --manifest"),
            }
        }
        Commands::Worker { once } => {
            queue.init().await?;
            let engine = Arc::new(CommandTranscriber::new(
                &cfg.engine.program,
                &cfg.engine.model,
                cfg.engine.args.clone(),
            ));
            let worker = RelayWorker::new(queue, engine, &cfg.worker.name)
                .with_selector(cfg.worker.selector)
                .with_interval(Duration::from_secs(cfg.worker.poll_secs.max(1)));
            if once {
                return Ok(match worker.poll_outcome().await? {
                    PollOutcome::Empty => EXIT_EMPTY,
                    PollOutcome::Dead(_) => 1,
                    PollOutcome::Completed(_) | PollOutcome::Requeued(_) => 0,
                });
            }
            worker.run().await;
            Ok(0)
        }
        Commands::Drain { once } => {
            queue.init().await?;
            let sink = Arc::new(DirSink::new(&cfg.drain.output_dir));
            let mut drain = DrainRunner::new(queue, sink)
                .with_interval(Duration::from_secs(cfg.drain.poll_secs.max(1)));
            match build_mux(&cfg)? {
                Some(mux) => drain = drain.with_multiplexer(Arc::new(mux)),
                None => warn!("no summary providers configured, delivering transcripts only"),
            }
            if once {
                let collected = drain.drain_once().await?;
                info!("collected {collected} transcripts");
                return Ok(if collected == 0 { EXIT_EMPTY } else { 0 });
            }
            drain.run().await;
            Ok(0)
        }
        Commands::Check => cmd_check(&cfg, &queue).await,
        Commands::Resummarize => {
            let mux = build_mux(&cfg)?
                .context("resummarize needs at least one provider in [summarize]")?;
            let sink = DirSink::new(&cfg.drain.output_dir);
            let repaired = resummarize(&sink, &mux).await?;
            println!("backfilled {repaired} summaries");
            Ok(0)
        }
        Commands::Status => {
            let stats = queue.stats().await?;
            println!("pending    {}", stats.pending);
            println!("claimed    {}", stats.claimed);
            println!("completed  {}", stats.completed);
            println!("dead       {}", stats.dead);
            Ok(0)
        }
        Commands::Gc => {
            let swept = queue.gc().await?;
            println!(
                "removed {} payloads, {} results",
                swept.payloads, swept.results
            );
            Ok(0)
        }
    }
}

fn build_queue(cfg: &Config) -> Result<Arc<TaskQueue>> {
    let store = WebdavStore::new(
        &cfg.storage.url,
        &cfg.storage.username,
        &cfg.storage.password,
        cfg.storage.proxy.as_deref(),
    )?;
    Ok(Arc::new(TaskQueue::new(
        Arc::new(store),
        cfg.queue.lease_secs.max(1) as u64,
        cfg.queue.max_attempts.max(1) as u32,
    )))
}

fn build_mux(cfg: &Config) -> Result<Option<Multiplexer>> {
    if cfg.summarize.providers.is_empty() {
        return Ok(None);
    }
    let mux = Multiplexer::from_configs(
        &cfg.summarize.providers,
        cfg.summarize.timeout_secs,
        cfg.summarize.retries,
        cfg.summarize.reduce,
    )?;
    Ok(Some(mux))
}

async fn cmd_enqueue_file(
    queue: &TaskQueue,
    file: &Path,
    id: Option<String>,
    duration: Option<f64>,
    language: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .context("cannot derive an id from that file name, pass --id")?
            .to_string(),
    };
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("bin");
    entry::validate_ext(ext)?;

    let media = tokio::fs::read(file)
        .await
        .with_context(|| format!("read {}", file.display()))?;
    let job = Job {
        id: id.clone(),
        payload: entry::payload_path(&id, ext),
        duration_secs: duration,
        language,
        title,
        created_at: chrono::Utc::now(),
    };
    queue.enqueue(&job, &media).await?;
    info!("queued {id} ({} bytes)", media.len());
    Ok(())
}

#[derive(Deserialize)]
struct ManifestLine {
    bvid: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    status: Option<String>,
}

const MEDIA_EXTS: [&str; 6] = ["m4a", "mp3", "wav", "mp4", "webm", "flac"];

async fn find_media(dir: &Path, id: &str) -> Option<PathBuf> {
    for ext in MEDIA_EXTS {
        let candidate = dir.join(format!("{id}.{ext}"));
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// One video per line, as the scraper writes them. Lines that cannot
/// be parsed, have no media file on disk, or are already queued are
/// logged and skipped.
async fn cmd_enqueue_manifest(
    queue: &TaskQueue,
    manifest: &Path,
    media_dir: &Path,
    language: Option<String>,
) -> Result<usize> {
    let raw = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("read {}", manifest.display()))?;

    let mut added = 0;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: ManifestLine = match serde_json::from_str(line) {
            Ok(item) => item,
            Err(e) => {
                warn!("skipping unparseable line: {e}");
                continue;
            }
        };
        if let Some(status) = &item.status {
            if status != "normal" {
                info!("{} is {status}, skipping", item.bvid);
                continue;
            }
        }
        let media_file = match find_media(media_dir, &item.bvid).await {
            Some(f) => f,
            None => {
                warn!(
                    "no media for {} under {}, skipping",
                    item.bvid,
                    media_dir.display()
                );
                continue;
            }
        };
        let ext = media_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let media = tokio::fs::read(&media_file)
            .await
            .with_context(|| format!("read {}", media_file.display()))?;
        let job = Job {
            id: item.bvid.clone(),
            payload: entry::payload_path(&item.bvid, &ext),
            duration_secs: item.duration,
            language: language.clone(),
            title: item.title.clone(),
            created_at: chrono::Utc::now(),
        };
        match queue.enqueue(&job, &media).await {
            Ok(()) => {
                info!("queued {}", item.bvid);
                added += 1;
            }
            Err(QueueError::AlreadyExists(_)) => {
                info!("{} already queued", item.bvid);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(added)
}

async fn cmd_check(cfg: &Config, queue: &TaskQueue) -> Result<u8> {
    queue.probe().await?;
    println!("storage      ok ({})", cfg.storage.url);

    let mux = match build_mux(cfg)? {
        Some(mux) => mux,
        None => {
            println!("providers    none configured");
            return Ok(0);
        }
    };

    let mut failed = false;
    let mut auth = false;
    for r in mux.check().await {
        match r.status {
            DispatchStatus::Ok => println!("{:<12} ok ({}ms)", r.provider, r.latency_ms),
            _ => {
                failed = true;
                let detail = r.detail.as_deref().unwrap_or("failed");
                if detail.contains("authentication") {
                    auth = true;
                }
                println!("{:<12} {detail}", r.provider);
            }
        }
    }
    Ok(if auth {
        EXIT_AUTH
    } else if failed {
        1
    } else {
        0
    })
}
