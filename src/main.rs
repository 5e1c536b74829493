//! hier-ocr - Real-time hierarchical detection and OCR pipeline
//!
//! Groups detected list items with their attribute regions, reads each region
//! and emits one deduplicated record per item. The `replay` command drives the
//! pipeline from recorded images and a manifest of detector/OCR results.

mod cache;
mod capture;
mod config;
mod error;
mod pipeline;
mod records;
mod vision;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::capture::replay::ReplaySource;
use crate::capture::{Frame, FrameSource};
use crate::config::{AppConfig, PerformanceMode};
use crate::pipeline::Pipeline;
use crate::vision::annotate::DisplayFrame;
use crate::vision::manifest::Manifest;

/// Consecutive idle polls before a finished replay is considered drained
const DRAINED_POLLS: u32 = 3;

/// hier-ocr - hierarchical detection + OCR record pipeline
#[derive(Parser, Debug)]
#[command(name = "hier-ocr")]
#[command(about = "Turns captured list screens into deduplicated structured records")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline over a directory of captured images
    Replay {
        /// Directory with the captured images
        dir: PathBuf,

        /// Detector/OCR manifest (defaults to <DIR>/manifest.json)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Configuration file (defaults to the user config, if any)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Performance mode: fast, balanced or accurate
        #[arg(long)]
        mode: Option<PerformanceMode>,

        /// Write annotated frames as PNG into this directory, and a crop of
        /// every accepted item into its `items/` subdirectory
        #[arg(long)]
        save_annotated: Option<PathBuf>,

        /// Replay the images in a loop
        #[arg(long)]
        loop_frames: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Write the default configuration
    InitConfig {
        /// Target file (defaults to the user config location)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr, records to stdout
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Replay {
            dir,
            manifest,
            config,
            mode,
            save_annotated,
            loop_frames,
            duration,
        } => {
            let mut app_config = config::load_or_default(config.as_deref())?;
            if let Some(mode) = mode {
                app_config.pipeline.performance_mode = mode;
            }
            let manifest = manifest.unwrap_or_else(|| dir.join("manifest.json"));
            run_replay(
                app_config,
                &dir,
                &manifest,
                save_annotated.as_deref(),
                loop_frames,
                duration.map(Duration::from_secs),
            )
        }
        Command::InitConfig { path, force } => init_config(path, force),
    }
}

/// Replay source that reports when every image was handed out
struct TrackedReplay {
    source: ReplaySource,
    finished: Arc<AtomicBool>,
}

impl FrameSource for TrackedReplay {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.source.next_frame()?;
        if frame.is_none() && self.source.is_exhausted() {
            self.finished.store(true, Ordering::SeqCst);
        }
        Ok(frame)
    }
}

fn run_replay(
    mut config: AppConfig,
    dir: &Path,
    manifest_path: &Path,
    save_annotated: Option<&Path>,
    loop_frames: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let source = ReplaySource::open(dir)?.looping(loop_frames);
    if source.is_empty() {
        bail!("No images found in {}", dir.display());
    }
    let manifest = Manifest::load(manifest_path)?.with_order(source.file_names());
    if manifest.is_empty() {
        warn!("Manifest {:?} lists no frames, nothing will be detected", manifest_path);
    } else {
        info!("Manifest lists {} frames for {} images", manifest.len(), source.len());
    }
    let manifest = Arc::new(manifest);

    if let Some(out_dir) = save_annotated {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;
        config.pipeline.item_image_dir = Some(out_dir.join("items"));
    }

    let finished = Arc::new(AtomicBool::new(false));
    let tracked = TrackedReplay {
        source,
        finished: Arc::clone(&finished),
    };

    let mut pipeline = Pipeline::new(config, tracked, manifest.clone(), manifest)?;
    let records = pipeline.records();
    let display = pipeline.display_frames();
    pipeline.start()?;

    let started = Instant::now();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut drained_polls = 0;

    loop {
        if let Ok(record) = records.recv_timeout(Duration::from_millis(50)) {
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
        for record in records.try_iter() {
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
        for frame in display.try_iter() {
            if let Some(out_dir) = save_annotated {
                save_display_frame(out_dir, &frame);
            }
        }

        if !pipeline.is_running() {
            warn!("Pipeline stopped on its own");
            break;
        }
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Replay duration reached");
            break;
        }
        if finished.load(Ordering::SeqCst) && pipeline.is_drained() {
            drained_polls += 1;
            if drained_polls >= DRAINED_POLLS {
                info!("Replay finished");
                break;
            }
        } else {
            drained_polls = 0;
        }
    }

    pipeline.stop()?;
    for record in records.try_iter() {
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
    }
    out.flush()?;

    let store = pipeline.record_store();
    if store.is_empty() {
        warn!("No records were extracted");
    }
    for record in store.records().iter().filter(|r| !r.error_status().is_ok()) {
        info!("Incomplete: '{}' [{}]", record.title(), record.error_status());
    }

    let stats = pipeline.stats();
    info!("Stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}

fn save_display_frame(out_dir: &Path, frame: &DisplayFrame) {
    let path = out_dir.join(format!("frame_{:05}.png", frame.sequence));
    if let Err(e) = frame.image.save(&path) {
        warn!("Failed to save annotated frame {:?}: {}", path, e);
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => config::default_config_path().context("No config directory for this platform")?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::save_config(&AppConfig::default(), &path)?;
    info!("Wrote default configuration to {:?}", path);
    Ok(())
}
