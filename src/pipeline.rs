use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use crate::converter::Converter;
use crate::error::{Error, IoContext, Result};
use crate::exif::{MetadataTool, commands};
use crate::geometry;
use crate::settings::{EditSettings, ExportSettings};
use crate::workspace::{Workspace, Workspaces};
use crate::{fsutil, sidecar};

/// Long edge of the edit cache.
pub const DEFAULT_CACHE_SIZE: u32 = 2560;

/// RAW formats the converter accepts.
const RAW_EXTENSIONS: &[&str] = &[
    "crw", "nef", "raf", "orf", "mrw", "dcr", "mos", "raw", "pef", "srf", "dng", "x3f", "cr2",
    "erf", "sr2", "kdc", "mfw", "mef", "arw", "nrw", "rw2", "rwl", "iiq", "3fr", "fff", "srw",
    "gpr", "dxo", "arq", "cr3",
];

/// How a preview is rendered, chosen from the requested size and whether
/// the photo already has an edit cache.
///
/// | size | cache | plan |
/// |---|---|---|
/// | 0 | any | [`PreviewPlan::FullResolution`] |
/// | > 0 | present | [`PreviewPlan::FromCache`] |
/// | > 0 | missing | [`PreviewPlan::BuildCache`] |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewPlan {
    /// Convert the original at native size.
    FullResolution,
    /// Render the requested size from the existing edit cache.
    FromCache,
    /// Convert the original into a new edit cache and preview that.
    BuildCache,
}

impl PreviewPlan {
    pub fn choose(size: u32, has_cache: bool) -> Self {
        match (size, has_cache) {
            (0, _) => Self::FullResolution,
            (_, true) => Self::FromCache,
            (_, false) => Self::BuildCache,
        }
    }
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Edit operations on single photos.
///
/// Each operation opens the photo's workspace, runs its converter and
/// exiftool steps strictly in order, and closes the workspace again. The
/// first failing step aborts the operation with that step's error.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use std::sync::Arc;
///
/// use darkroom::converter::DngConverter;
/// use darkroom::exif::ExifTool;
/// use darkroom::pipeline::Pipeline;
/// use darkroom::settings::EditSettings;
/// use darkroom::workspace::Workspaces;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> darkroom::Result<()> {
/// let exiftool = Arc::new(ExifTool::start("exiftool").await?);
/// let pipeline = Pipeline::new(
///     Arc::new(DngConverter::new("/Applications/Adobe DNG Converter.app/Contents/MacOS/Adobe DNG Converter")),
///     exiftool.clone(),
///     Arc::new(Workspaces::new(std::env::temp_dir().join("darkroom"), 16)),
/// );
///
/// let photo = Path::new("/photos/DSC_0001.NEF");
/// let mut edit = pipeline.load(photo).await?;
/// edit.exposure = Some(0.5);
/// let jpeg = pipeline.preview(photo, 1024, &edit, &CancellationToken::new()).await?;
/// pipeline.save(photo, &edit, &CancellationToken::new()).await?;
/// # let _ = jpeg;
/// exiftool.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    converter: Arc<dyn Converter>,
    meta: Arc<dyn MetadataTool>,
    workspaces: Arc<Workspaces>,
    cache_size: u32,
}

impl Pipeline {
    pub fn new(
        converter: Arc<dyn Converter>,
        meta: Arc<dyn MetadataTool>,
        workspaces: Arc<Workspaces>,
    ) -> Self {
        Self {
            converter,
            meta,
            workspaces,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    /// Override the long edge of the edit cache.
    pub fn with_cache_size(mut self, cache_size: u32) -> Self {
        self.cache_size = cache_size.max(1);
        self
    }

    pub fn metadata(&self) -> &dyn MetadataTool {
        self.meta.as_ref()
    }

    async fn open(&self, photo: &Path) -> Result<Workspace> {
        self.workspaces.open(self.meta.as_ref(), photo).await
    }

    /// Replace a camera matching white balance with the camera's own.
    async fn resolve(&self, ws: &Workspace, edit: &EditSettings) -> Result<EditSettings> {
        let mut edit = edit.clone();
        if edit.needs_camera_white_balance() {
            let wb = commands::camera_white_balance(self.metadata(), ws.origin()).await?;
            log::debug!("camera matching white balance: {}", wb.as_str());
            edit.white_balance = Some(wb);
        }
        Ok(edit)
    }

    /// Current develop settings of a photo; defaults when it has none.
    pub async fn load(&self, photo: &Path) -> Result<EditSettings> {
        let ws = self.open(photo).await?;
        let edit = commands::read_settings(self.metadata(), ws.working_xmp()).await?;
        ws.close();
        Ok(edit)
    }

    /// Persist develop settings for a photo. Returns the file written.
    ///
    /// Settings go to the photo's sidecar, or, for a DNG that already
    /// carries its own edits, into a re-rendered copy of the DNG that
    /// keeps its preview size.
    pub async fn save(
        &self,
        photo: &Path,
        edit: &EditSettings,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let ws = self.open(photo).await?;
        let edit = self.resolve(&ws, edit).await?;
        check(cancel)?;

        commands::write_settings(self.metadata(), ws.working_xmp(), &edit).await?;
        let dest = sidecar::write_destination(self.metadata(), ws.photo()).await?;
        check(cancel)?;

        if dest == ws.photo() {
            let export = ExportSettings {
                dng: true,
                embed: true,
                preview: Some(commands::dng_preview(self.metadata(), ws.origin()).await?),
                ..Default::default()
            };
            self.converter
                .convert(ws.origin(), ws.scratch(), 0, Some(&export), cancel)
                .await?;
            fsutil::publish_file(ws.scratch(), &dest, false)?;
        } else {
            fsutil::publish_file(ws.working_xmp(), &dest, true)?;
        }
        log::info!("saved {}", dest.display());
        ws.close();
        Ok(dest)
    }

    /// Render a JPEG preview with `edit` applied.
    ///
    /// `size` is the long edge in pixels; `0` renders at full resolution.
    pub async fn preview(
        &self,
        photo: &Path,
        size: u32,
        edit: &EditSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let ws = self.open(photo).await?;
        let edit = self.resolve(&ws, edit).await?;
        check(cancel)?;

        let plan = PreviewPlan::choose(size, ws.has_edit_cache());
        log::debug!("preview {} at {size}: {plan:?}", photo.display());

        let jpeg = match plan {
            PreviewPlan::FullResolution => {
                commands::write_settings(self.metadata(), ws.working_xmp(), &edit).await?;
                let export = ExportSettings::default();
                self.converter
                    .convert(ws.origin(), ws.scratch(), 0, Some(&export), cancel)
                    .await?;
                commands::extract_jpeg(self.metadata(), ws.scratch()).await?
            }
            PreviewPlan::FromCache => {
                // settings left in the cache by an earlier preview must not leak through
                let cache = ws.edit_cache();
                commands::reset_settings(self.metadata(), &cache, ws.working_xmp()).await?;
                commands::write_settings(self.metadata(), &cache, &edit).await?;
                let side = size.min(self.cache_size);
                self.converter
                    .convert(&cache, ws.scratch(), side, None, cancel)
                    .await?;
                commands::extract_jpeg(self.metadata(), ws.scratch()).await?
            }
            PreviewPlan::BuildCache => {
                let cache = ws.edit_cache();
                commands::write_settings(self.metadata(), ws.working_xmp(), &edit).await?;
                self.converter
                    .convert(ws.origin(), ws.scratch(), self.cache_size, None, cancel)
                    .await?;
                fsutil::move_file(ws.scratch(), &cache)?;
                commands::extract_jpeg(self.metadata(), &cache).await?
            }
        };
        ws.close();
        Ok(jpeg)
    }

    /// Export a photo at full resolution. Returns the exported file's bytes.
    pub async fn export(
        &self,
        photo: &Path,
        edit: &EditSettings,
        export: &ExportSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let ws = self.open(photo).await?;
        let edit = self.resolve(&ws, edit).await?;
        check(cancel)?;

        commands::write_settings(self.metadata(), ws.working_xmp(), &edit).await?;
        self.converter
            .convert(ws.origin(), ws.scratch(), 0, Some(export), cancel)
            .await?;
        check(cancel)?;

        let data = if export.dng {
            commands::fix_meta_dng(self.metadata(), ws.origin(), ws.scratch(), ws.photo()).await?;
            std::fs::read(ws.scratch()).at(ws.scratch())?
        } else {
            let mut jpeg = commands::extract_jpeg(self.metadata(), ws.scratch()).await?;
            if let Some(resample) = &export.resample {
                jpeg = geometry::resample_jpeg(&jpeg, resample)?;
            }
            let out = ws.scratch_jpeg();
            fsutil::write_file(out, &jpeg)?;
            commands::inject_xmp(self.metadata(), ws.scratch(), out).await?;
            commands::fix_meta_jpeg(self.metadata(), ws.origin(), out).await?;
            std::fs::read(out).at(out)?
        };
        ws.close();
        Ok(data)
    }
}

/// Where an export of `photo` is written by default: same name, new extension.
pub fn export_path(photo: &Path, export: &ExportSettings) -> PathBuf {
    photo.with_extension(export.extension())
}

/// A photo found by [`collect_photos`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub path: PathBuf,
    /// Path relative to the argument it was found under.
    pub name: PathBuf,
}

/// Collect RAW photos from files and directories.
///
/// Directories are walked recursively (following symlinks), skipping
/// hidden files and directories. Each photo keeps its path relative to the
/// directory it was found in, so exports can mirror the input tree.
pub fn collect_photos(paths: &[PathBuf]) -> Vec<Photo> {
    let mut photos = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_raw(path) {
                photos.push(Photo {
                    path: path.clone(),
                    name: path.file_name().map(PathBuf::from).unwrap_or_default(),
                });
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if entry.file_type().is_file() && is_raw(p) {
                    photos.push(Photo {
                        path: p.to_path_buf(),
                        name: p.strip_prefix(path).unwrap_or(p).to_path_buf(),
                    });
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    photos
}

fn is_raw(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| RAW_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}
