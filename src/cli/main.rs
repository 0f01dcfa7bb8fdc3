use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use darkroom::batch::{self, Job};
use darkroom::config::Config;
use darkroom::converter::DngConverter;
use darkroom::exif::{ExifTool, commands};
use darkroom::fsutil;
use darkroom::pipeline::{self, Photo, Pipeline};
use darkroom::settings::{EditSettings, ExportSettings};
use darkroom::workspace::Workspaces;

#[derive(Parser, Debug)]
#[command(
    name = "darkroom",
    version,
    about = "Non-destructive RAW editing and export through Adobe DNG Converter and exiftool"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config.json and exit
    Init,

    /// Print a photo's current develop settings as JSON
    Settings {
        photo: PathBuf,
    },

    /// Print every metadata tag of a photo, grouped, as HTML
    Meta {
        photo: PathBuf,
    },

    /// Save develop settings (JSON file) for a photo
    Save {
        photo: PathBuf,
        #[arg(long, value_name = "FILE")]
        edit: PathBuf,
    },

    /// Render a JPEG preview
    Preview {
        photo: PathBuf,
        /// Long edge in pixels; 0 for full resolution
        #[arg(long, default_value_t = 0)]
        size: u32,
        #[arg(long, value_name = "FILE")]
        edit: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },

    /// Export one photo
    Export {
        photo: PathBuf,
        #[arg(long, value_name = "FILE")]
        edit: Option<PathBuf>,
        /// Export settings (JSON file); default is a full size JPEG
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Export many photos, streaming results as NDJSON to stdout
    Batch {
        /// RAW files or directories
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        #[arg(long, value_name = "FILE")]
        edit: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
        /// Photos exported at the same time (default from config)
        #[arg(short = 'j', long)]
        parallelism: Option<usize>,
    },
}

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if let Command::Init = cli.command {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;

    let exiftool = Arc::new(
        ExifTool::start(&config.tools.exiftool)
            .await
            .context("Failed to start exiftool")?,
    );
    let pipeline = Arc::new(
        Pipeline::new(
            Arc::new(DngConverter::new(&config.tools.dng_converter)),
            exiftool.clone(),
            Arc::new(Workspaces::new(
                &config.workspace.root,
                config.workspace.max_workspaces,
            )),
        )
        .with_cache_size(config.preview.cache_size),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let result = run(cli.command, &config, pipeline, &cancel).await;

    if let Err(e) = exiftool.shutdown().await {
        log::warn!("{e}");
    }
    result
}

async fn run(
    command: Command,
    config: &Config,
    pipeline: Arc<Pipeline>,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        // handled before the tools start
        Command::Init => {}

        Command::Settings { photo } => {
            let edit = pipeline.load(&photo).await?;
            println!("{}", serde_json::to_string_pretty(&edit)?);
        }

        Command::Meta { photo } => {
            let html = commands::photo_meta(pipeline.metadata(), &photo).await?;
            std::io::stdout()
                .write_all(&html)
                .context("Failed to write metadata")?;
        }

        Command::Save { photo, edit } => {
            let edit: EditSettings = read_json(&edit)?;
            let dest = pipeline.save(&photo, &edit, cancel).await?;
            println!("{}", dest.display());
        }

        Command::Preview {
            photo,
            size,
            edit,
            out,
        } => {
            let edit = read_optional_json::<EditSettings>(edit.as_deref())?;
            let jpeg = pipeline.preview(&photo, size, &edit, cancel).await?;
            fsutil::write_file(&out, &jpeg)?;
            log::info!("Preview written to {}", out.display());
        }

        Command::Export {
            photo,
            edit,
            export,
            out,
        } => {
            let name = photo
                .file_name()
                .map(PathBuf::from)
                .context("Photo path has no file name")?;
            let job = Job {
                edit: read_optional_json(edit.as_deref())?,
                export: read_optional_json(export.as_deref())?,
                out_dir: out,
                parallelism: 1,
            };
            let outcome =
                batch::export_photo(&pipeline, &job, Photo { path: photo, name }, cancel).await;
            for output in &outcome.outputs {
                println!("{GREEN}✓{RESET} {}", batch::relative_output(&job, output).display());
            }
            if let Some(error) = &outcome.error {
                anyhow::bail!("{}: {error}", outcome.path.display());
            }
        }

        Command::Batch {
            paths,
            out,
            edit,
            export,
            parallelism,
        } => {
            let photos = pipeline::collect_photos(&paths);
            if photos.is_empty() {
                anyhow::bail!("No RAW photos found in the specified paths.");
            }
            log::info!("Found {} photo(s) to export", photos.len());

            let job = Job {
                edit: read_optional_json(edit.as_deref())?,
                export: read_optional_json::<ExportSettings>(export.as_deref())?,
                out_dir: out,
                parallelism: parallelism.unwrap_or(config.batch.parallelism),
            };
            let stream = batch::run(pipeline, photos, job, cancel.clone());
            let summary = batch::write_ndjson(stream, tokio::io::stdout())
                .await
                .context("Failed to write results")?;

            let (color, mark) = if summary.is_partial() { (RED, "✗") } else { (GREEN, "✓") };
            eprintln!(
                "{color}{mark}{RESET} Done: {} succeeded, {} failed out of {} photos",
                summary.succeeded, summary.failed, summary.total
            );
            if summary.is_partial() {
                anyhow::bail!("{} of {} photos failed", summary.failed, summary.total);
            }
        }
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_optional_json<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(p) => read_json(p),
        None => Ok(T::default()),
    }
}
