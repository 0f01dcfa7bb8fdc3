//! Error taxonomy for edit and export operations.
//!
//! Not-found conditions on sidecar probes never surface here: the resolver
//! and workspace consume them to drive their fallbacks. Everything else is
//! propagated verbatim to the caller of a single-photo operation, or recorded
//! in the item outcome of a batch.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {tool}: {source}")]
    ToolStart {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("DNG converter failed ({status}): {stderr}")]
    Converter { status: String, stderr: String },

    #[error("exiftool: {0}")]
    ExifTool(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("camera matching white balance must be resolved before it is written")]
    UnresolvedWhiteBalance,

    #[error("no free file name near {}", .0.display())]
    NoFreeName(PathBuf),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Attach a path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
