//! Bulk export.
//!
//! [`run`] fans the export of many photos out over a fixed number of
//! workers and streams one [`Outcome`] per photo as soon as it is known.
//! Outcomes arrive in completion order; consumers key them by
//! [`Outcome::path`].

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, IoContext, Result};
use crate::fsutil;
use crate::pipeline::{Photo, Pipeline, export_path};
use crate::settings::{EditSettings, ExportSettings};

/// Workers used when the caller does not say.
pub const DEFAULT_PARALLELISM: usize = 2;

/// What to do with every photo of a batch.
#[derive(Debug, Clone)]
pub struct Job {
    pub edit: EditSettings,
    pub export: ExportSettings,
    /// Exports land here, mirroring each photo's relative name.
    pub out_dir: PathBuf,
    pub parallelism: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Failed,
}

/// Result of exporting one photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub path: PathBuf,
    pub status: Status,
    /// Files written for this photo, including those written before a failure.
    pub outputs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    fn ok(path: PathBuf, outputs: Vec<PathBuf>) -> Self {
        Self {
            path,
            status: Status::Ok,
            outputs,
            error: None,
        }
    }

    fn failed(path: PathBuf, outputs: Vec<PathBuf>, error: &Error) -> Self {
        Self {
            path,
            status: Status::Failed,
            outputs,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// A running batch: its size, and the outcomes as they complete.
pub struct Batch {
    pub total: usize,
    pub outcomes: mpsc::Receiver<Outcome>,
}

impl Batch {
    /// Wait for every outcome.
    pub async fn collect(mut self) -> Vec<Outcome> {
        let mut all = Vec::with_capacity(self.total);
        while let Some(outcome) = self.outcomes.recv().await {
            all.push(outcome);
        }
        all
    }
}

/// Start exporting `photos`.
///
/// Exactly one outcome is produced per photo. Once `cancel` fires, photos
/// not yet started are reported as cancelled without being touched, and
/// in-flight exports abort; files already written stay.
///
/// Must be called within a tokio runtime.
pub fn run(
    pipeline: Arc<Pipeline>,
    photos: Vec<Photo>,
    job: Job,
    cancel: CancellationToken,
) -> Batch {
    let total = photos.len();
    let workers = job.parallelism.max(1).min(total.max(1));
    let (tx, rx) = mpsc::channel(total.max(1));

    let mut job = job;
    // photos keep their own orientation
    job.edit.orientation = None;
    let job = Arc::new(job);
    let queue = Arc::new(Mutex::new(VecDeque::from(photos)));

    log::info!("batch: {total} photo(s), {workers} worker(s)");
    let mut set = JoinSet::new();
    for _ in 0..workers {
        set.spawn(worker(
            pipeline.clone(),
            job.clone(),
            queue.clone(),
            tx.clone(),
            cancel.clone(),
        ));
    }
    drop(tx);

    tokio::spawn(async move {
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                log::error!("batch worker panicked: {e}");
            }
        }
        log::info!("batch finished");
    });

    Batch { total, outcomes: rx }
}

async fn worker(
    pipeline: Arc<Pipeline>,
    job: Arc<Job>,
    queue: Arc<Mutex<VecDeque<Photo>>>,
    tx: mpsc::Sender<Outcome>,
    cancel: CancellationToken,
) {
    loop {
        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let Some(photo) = next else {
            break;
        };

        let outcome = if cancel.is_cancelled() {
            Outcome::failed(photo.path, Vec::new(), &Error::Cancelled)
        } else {
            export_photo(&pipeline, &job, photo, &cancel).await
        };
        if let Some(error) = &outcome.error {
            log::warn!("{}: {error}", outcome.path.display());
        }
        if tx.send(outcome).await.is_err() {
            // receiver gone; nobody is listening
            break;
        }
    }
}

/// Export one photo into the job's output directory, then its companion
/// JPEG when asked to.
///
/// Unlike [`run`], the job's edit settings are applied as given.
pub async fn export_photo(
    pipeline: &Pipeline,
    job: &Job,
    photo: Photo,
    cancel: &CancellationToken,
) -> Outcome {
    let mut outputs = Vec::new();

    match export_one(pipeline, job, &photo, &job.export, cancel).await {
        Ok(out) => outputs.push(out),
        Err(e) => return Outcome::failed(photo.path, outputs, &e),
    }

    if job.export.dng && job.export.both {
        let jpeg = ExportSettings {
            resample: job.export.resample.clone(),
            ..Default::default()
        };
        match export_one(pipeline, job, &photo, &jpeg, cancel).await {
            Ok(out) => outputs.push(out),
            Err(e) => return Outcome::failed(photo.path, outputs, &e),
        }
    }
    Outcome::ok(photo.path, outputs)
}

async fn export_one(
    pipeline: &Pipeline,
    job: &Job,
    photo: &Photo,
    export: &ExportSettings,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let data = pipeline.export(&photo.path, &job.edit, export, cancel).await?;
    let desired = job.out_dir.join(export_path(&photo.name, export));
    if let Some(dir) = desired.parent() {
        std::fs::create_dir_all(dir).at(dir)?;
    }
    let written = fsutil::publish_new(&desired, &data)?;
    log::debug!("{} -> {}", photo.path.display(), written.display());
    Ok(written)
}

/// Counts of a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Summary {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Serialize)]
struct Header {
    total: usize,
}

async fn write_line<W, T>(out: &mut W, record: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Stream a batch as newline-delimited JSON: a `{"total":N}` line, then one
/// line per outcome as it completes.
pub async fn write_ndjson<W>(mut batch: Batch, mut out: W) -> io::Result<Summary>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = Summary {
        total: batch.total,
        ..Default::default()
    };
    write_line(&mut out, &Header { total: batch.total }).await?;

    while let Some(outcome) = batch.outcomes.recv().await {
        if outcome.is_ok() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        write_line(&mut out, &outcome).await?;
    }
    Ok(summary)
}

/// Relative name of an output inside the batch directory, for display.
pub fn relative_output<'a>(job: &Job, output: &'a Path) -> &'a Path {
    output.strip_prefix(&job.out_dir).unwrap_or(output)
}
