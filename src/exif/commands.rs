//! The exiftool commands the edit pipeline depends on.
//!
//! Every command names its target file last.

use std::io::Cursor;
use std::path::Path;

use super::MetadataTool;
use crate::error::{Error, Result};
use crate::settings::{DngPreview, EditSettings, WhiteBalance};

/// Long edge of the medium preview the DNG converter embeds with `-p1`.
const MEDIUM_PREVIEW_EDGE: u32 = 1024;

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Read develop settings from an XMP file (or any container carrying XMP).
///
/// A missing file yields the default settings.
pub async fn read_settings(tool: &dyn MetadataTool, path: &Path) -> Result<EditSettings> {
    if !path.exists() {
        return Ok(EditSettings::default());
    }
    log::debug!("exiftool (read settings)...");
    let mut args = owned(&["-j", "-n", "-XMP-crs:all", "-XMP-tiff:Orientation"]);
    args.push(arg(path));
    let out = tool.command(&args).await?;
    if out.iter().all(u8::is_ascii_whitespace) {
        return Ok(EditSettings::default());
    }
    let mut all: Vec<EditSettings> = serde_json::from_slice(&out)?;
    Ok(if all.is_empty() {
        EditSettings::default()
    } else {
        all.swap_remove(0)
    })
}

/// Write develop settings into `target`, creating an XMP file if needed.
pub async fn write_settings(
    tool: &dyn MetadataTool,
    target: &Path,
    settings: &EditSettings,
) -> Result<()> {
    let mut args = settings.xmp_args()?;
    args.push("-overwrite_original".into());
    args.push(arg(target));
    log::debug!("exiftool (edit xmp)...");
    tool.command(&args).await?;
    Ok(())
}

/// The raw XMP packet embedded in `path`; empty when there is none.
pub async fn extract_xmp(tool: &dyn MetadataTool, path: &Path) -> Result<Vec<u8>> {
    log::debug!("exiftool (extract xmp)...");
    let mut args = owned(&["-b", "-XMP"]);
    args.push(arg(path));
    tool.command(&args).await
}

/// Whether a DNG already carries develop history of its own.
pub async fn dng_has_edits(tool: &dyn MetadataTool, path: &Path) -> Result<bool> {
    log::debug!("exiftool (has edits?)...");
    let mut args = owned(&["-XMP-photoshop:all"]);
    args.push(arg(path));
    let out = tool.command(&args).await?;
    Ok(!out.iter().all(u8::is_ascii_whitespace))
}

/// Resolve "camera matching" white balance from the camera's own tags.
///
/// Falls back to `As Shot` when the camera recorded nothing usable.
pub async fn camera_white_balance(tool: &dyn MetadataTool, path: &Path) -> Result<WhiteBalance> {
    log::debug!("exiftool (get camera matching white balance)...");
    let mut args = owned(&[
        "-duplicates",
        "-short3",
        "-fast",
        "-ExifIFD:WhiteBalance",
        "-MakerNotes:WhiteBalance",
    ]);
    args.push(arg(path));
    let out = tool.command(&args).await?;
    let wb = String::from_utf8_lossy(&out)
        .lines()
        .find_map(WhiteBalance::from_camera_tag)
        .unwrap_or(WhiteBalance::AsShot);
    Ok(wb)
}

/// Size class of the preview a DNG currently embeds.
///
/// Sized from the preview JPEG itself; IFD0 of a DNG only holds the
/// thumbnail.
pub async fn dng_preview(tool: &dyn MetadataTool, path: &Path) -> Result<DngPreview> {
    log::debug!("exiftool (dng preview size)...");
    let mut args = owned(&["-b", "-PreviewImage"]);
    args.push(arg(path));
    let out = tool.command(&args).await?;
    if out.is_empty() {
        return Ok(DngPreview::None);
    }
    let (width, height) = image::ImageReader::new(Cursor::new(&out))
        .with_guessed_format()
        .map_err(|e| Error::io(path, e))?
        .into_dimensions()?;
    Ok(if width.max(height) <= MEDIUM_PREVIEW_EDGE {
        DngPreview::Medium
    } else {
        DngPreview::Full
    })
}

/// Reset the develop settings of `target` to those of the sidecar `from`;
/// with no sidecar, clear them.
pub async fn reset_settings(tool: &dyn MetadataTool, target: &Path, from: &Path) -> Result<()> {
    let mut args = owned(&["-XMP-crs:all="]);
    if from.exists() {
        args.extend(["-tagsFromFile".to_string(), arg(from), "-XMP-crs:all".into()]);
    }
    args.push("-overwrite_original".into());
    args.push(arg(target));
    log::debug!("exiftool (reset xmp)...");
    tool.command(&args).await?;
    Ok(())
}

/// Every tag of a photo, grouped, as an HTML listing.
pub async fn photo_meta(tool: &dyn MetadataTool, path: &Path) -> Result<Vec<u8>> {
    log::debug!("exiftool (meta)...");
    let mut args = owned(&["-htmlFormat", "-groupHeadings", "-long", "-fixBase"]);
    args.push(arg(path));
    tool.command(&args).await
}

/// Pull the JPEG rendition out of a converted DNG.
pub async fn extract_jpeg(tool: &dyn MetadataTool, dng: &Path) -> Result<Vec<u8>> {
    log::debug!("exiftool (extract jpeg)...");
    let mut args = owned(&["-b", "-PreviewImage"]);
    args.push(arg(dng));
    let out = tool.command(&args).await?;
    if out.is_empty() {
        return Err(Error::ExifTool(format!(
            "{}: no preview image",
            dng.display()
        )));
    }
    Ok(out)
}

/// Re-tag an exported DNG from its original: maker notes and file name provenance.
pub async fn fix_meta_dng(
    tool: &dyn MetadataTool,
    orig: &Path,
    dest: &Path,
    name: &Path,
) -> Result<()> {
    let file_name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let args = vec![
        "-tagsFromFile".to_string(),
        arg(orig),
        "-fixBase".into(),
        "-MakerNotes".into(),
        format!("-OriginalRawFileName-={}", file_name(orig)),
        format!("-OriginalRawFileName={}", file_name(name)),
        "-overwrite_original".into(),
        arg(dest),
    ];
    log::debug!("exiftool (fix dng)...");
    tool.command(&args).await?;
    Ok(())
}

/// Copy the converted DNG's metadata (develop settings included) into a JPEG.
pub async fn inject_xmp(tool: &dyn MetadataTool, from: &Path, dest: &Path) -> Result<()> {
    let args = vec![
        "-tagsFromFile".to_string(),
        arg(from),
        "-overwrite_original".into(),
        arg(dest),
    ];
    log::debug!("exiftool (inject xmp)...");
    tool.command(&args).await?;
    Ok(())
}

/// Copy descriptive EXIF/GPS/IPTC/XMP fields from the original into a JPEG.
pub async fn fix_meta_jpeg(tool: &dyn MetadataTool, orig: &Path, dest: &Path) -> Result<()> {
    let mut args = vec!["-tagsFromFile".to_string(), arg(orig)];
    args.extend(owned(&[
        "-fixBase",
        "-CommonIFD0",
        "-ExifIFD:all",
        "-GPS:all",
        "-IPTC:all",
        "-XMP-dc:all",
        "-XMP-dc:Format=",
        "-fast",
        "-overwrite_original",
    ]));
    args.push(arg(dest));
    log::debug!("exiftool (fix jpeg)...");
    tool.command(&args).await?;
    Ok(())
}
