//! Bridge to the external RAW → DNG converter.
//!
//! Implement [`Converter`] to plug in another converter; the crate ships
//! [`DngConverter`], which drives Adobe DNG Converter as a child process.

mod dng;

pub use dng::DngConverter;

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::settings::{DngPreview, ExportSettings};

/// Converts a RAW (or DNG) file into a DNG.
///
/// Implementations must either leave a complete DNG at `dst` or fail
/// without leaving anything there.
#[async_trait::async_trait]
pub trait Converter: Send + Sync {
    /// Convert `src` into `dst`.
    ///
    /// * `side`: long edge of the output in pixels, `0` for native size
    /// * `export`: export options; `None` renders a plain working DNG
    /// * `cancel`: abandons the conversion when triggered
    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        side: u32,
        export: Option<&ExportSettings>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Converter flags for a conversion (output location excluded).
pub fn converter_args(side: u32, export: Option<&ExportSettings>) -> Vec<String> {
    let mut args = Vec::new();
    match export {
        Some(exp) if exp.dng => {
            match exp.preview {
                Some(DngPreview::None) => args.push("-p0".to_string()),
                Some(DngPreview::Medium) => args.push("-p1".to_string()),
                Some(DngPreview::Full) => args.push("-p2".to_string()),
                None => {}
            }
            if exp.lossy {
                args.push("-lossy".to_string());
            }
            if exp.embed {
                args.push("-e".to_string());
            }
        }
        // JPEGs are extracted from the embedded preview, so it must be full size
        _ => args.push("-p2".to_string()),
    }
    if side > 0 {
        args.push("-side".to_string());
        args.push(side.to_string());
    }
    args
}
