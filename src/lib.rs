//! # darkroom
//!
//! Non-destructive RAW editing and export, orchestrated over two external
//! programs: Adobe DNG Converter renders, exiftool reads and writes
//! metadata. darkroom decides which sidecar governs a photo, keeps a
//! per-photo workspace with a reusable downscaled edit cache, sequences the
//! converter and exiftool calls for load / save / preview / export, and
//! fans exports out over many photos at once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use darkroom::batch::{self, Job};
//! use darkroom::config::Config;
//! use darkroom::converter::DngConverter;
//! use darkroom::exif::ExifTool;
//! use darkroom::pipeline::{Pipeline, collect_photos};
//! use darkroom::settings::{EditSettings, ExportSettings};
//! use darkroom::workspace::Workspaces;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some("config.json".as_ref()))?;
//!
//!     let exiftool = Arc::new(ExifTool::start(&config.tools.exiftool).await?);
//!     let pipeline = Arc::new(Pipeline::new(
//!         Arc::new(DngConverter::new(&config.tools.dng_converter)),
//!         exiftool.clone(),
//!         Arc::new(Workspaces::new(&config.workspace.root, config.workspace.max_workspaces)),
//!     ));
//!
//!     let photos = collect_photos(&[PathBuf::from("./photos")]);
//!     let job = Job {
//!         edit: EditSettings::default(),
//!         export: ExportSettings::default(),
//!         out_dir: PathBuf::from("./export"),
//!         parallelism: config.batch.parallelism,
//!     };
//!     let outcomes = batch::run(pipeline, photos, job, CancellationToken::new())
//!         .collect()
//!         .await;
//!     for outcome in outcomes {
//!         println!("{}: {:?}", outcome.path.display(), outcome.status);
//!     }
//!
//!     exiftool.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Plugging in other tools
//!
//! The pipeline only sees the [`converter::Converter`] and
//! [`exif::MetadataTool`] traits; tests drive it with in-process fakes.

pub mod batch;
pub mod config;
pub mod converter;
pub mod error;
pub mod exif;
pub mod fsutil;
pub mod geometry;
pub mod pipeline;
pub mod settings;
pub mod sidecar;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
