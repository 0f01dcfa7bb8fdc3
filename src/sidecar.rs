//! Which metadata file governs a photo.
//!
//! A photo `DIR/NAME.EXT` may be described by `NAME.xmp`, by `NAME.EXT.xmp`,
//! or (for DNGs edited in place) by the XMP embedded in the photo itself.
//!
//! Reading, first match wins:
//! 1. `NAME.xmp`, if its declared target extension matches `EXT`
//! 2. `NAME.EXT.xmp`, under the same guard
//! 3. the XMP embedded in the photo
//!
//! Writing, first match wins:
//! 1. `NAME.xmp`, if it exists and passes the guard
//! 2. `NAME.EXT.xmp`, if it exists
//! 3. the photo itself, if it is a DNG that already carries develop history
//! 4. a new `NAME.xmp` (or `NAME.EXT.xmp` when `NAME.xmp` belongs to another file)
//!
//! Missing files drive the fallthrough; any other filesystem error aborts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::exif::{MetadataTool, commands};
use crate::fsutil;

/// XMP property naming the extension a sidecar was written for.
const SIDECAR_FOR_EXTENSION: &str = "SidecarForExtension";

/// Where a photo's current metadata comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    /// An external sidecar, with the contents read during resolution.
    Sidecar { path: PathBuf, contents: Vec<u8> },
    /// The XMP embedded in the photo.
    Embedded,
}

/// `NAME.xmp` for `NAME.EXT`; `None` when the photo has no extension.
pub fn plain_sidecar(photo: &Path) -> Option<PathBuf> {
    photo.extension()?;
    Some(photo.with_extension("xmp"))
}

/// `NAME.EXT.xmp` for `NAME.EXT`.
pub fn qualified_sidecar(photo: &Path) -> PathBuf {
    let mut name = photo.as_os_str().to_owned();
    name.push(".xmp");
    PathBuf::from(name)
}

fn extension(photo: &Path) -> String {
    photo
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Value of `SidecarForExtension`, as attribute or element.
fn declared_extension(text: &str) -> Option<&str> {
    let at = text.find(SIDECAR_FOR_EXTENSION)? + SIDECAR_FOR_EXTENSION.len();
    let rest = text[at..].trim_start();

    if let Some(rest) = rest.strip_prefix('=') {
        let rest = rest.trim_start();
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &rest[1..];
        let end = body.find(quote)?;
        Some(body[..end].trim())
    } else if let Some(rest) = rest.strip_prefix('>') {
        let end = rest.find('<')?;
        Some(rest[..end].trim())
    } else {
        None
    }
}

/// Whether an XMP sidecar belongs to a photo with extension `ext`.
///
/// A sidecar that does not declare its target extension belongs to any photo.
pub fn is_sidecar_for_ext(xmp: &[u8], ext: &str) -> bool {
    let text = String::from_utf8_lossy(xmp);
    match declared_extension(&text) {
        None => true,
        Some(declared) => {
            declared.is_empty() || declared.eq_ignore_ascii_case(ext.trim_start_matches('.'))
        }
    }
}

/// Read a sidecar candidate if it exists and passes the extension guard.
fn read_candidate(path: &Path, ext: &str) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) if is_sidecar_for_ext(&data, ext) => Ok(Some(data)),
        Ok(_) => {
            log::debug!("{} belongs to another extension, ignoring", path.display());
            Ok(None)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Resolve where the photo's metadata should be read from.
pub fn read_source(photo: &Path) -> Result<ReadSource> {
    let ext = extension(photo);
    let candidates = plain_sidecar(photo)
        .into_iter()
        .chain(std::iter::once(qualified_sidecar(photo)));

    for path in candidates {
        if let Some(contents) = read_candidate(&path, &ext)? {
            return Ok(ReadSource::Sidecar { path, contents });
        }
    }
    Ok(ReadSource::Embedded)
}

/// Resolve where updated metadata for the photo must be written.
pub async fn write_destination(tool: &dyn MetadataTool, photo: &Path) -> Result<PathBuf> {
    let ext = extension(photo);
    let plain = plain_sidecar(photo);

    if let Some(plain) = &plain {
        if read_candidate(plain, &ext)?.is_some() {
            return Ok(plain.clone());
        }
    }

    let qualified = qualified_sidecar(photo);
    if exists(&qualified)? {
        return Ok(qualified);
    }

    if ext.eq_ignore_ascii_case("dng") && commands::dng_has_edits(tool, photo).await? {
        return Ok(photo.to_path_buf());
    }

    match plain {
        // NAME.xmp is another file's sidecar; don't take it over
        Some(plain) if !exists(&plain)? => Ok(plain),
        _ => Ok(qualified),
    }
}

/// Copy the photo's current metadata into `dst` (removing `dst` when the
/// photo has none).
pub async fn stage(tool: &dyn MetadataTool, photo: &Path, dst: &Path) -> Result<()> {
    let contents = match read_source(photo)? {
        ReadSource::Sidecar { path, contents } => {
            log::debug!("using sidecar {}", path.display());
            contents
        }
        ReadSource::Embedded => commands::extract_xmp(tool, photo).await?,
    };

    if contents.is_empty() {
        match fs::remove_file(dst) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(dst, e)),
            _ => Ok(()),
        }
    } else {
        fsutil::write_file(dst, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTool;
    use tempfile::TempDir;

    const XMP_FOR_NEF: &[u8] =
        br#"<x:xmpmeta><rdf:Description photoshop:SidecarForExtension="NEF" crs:Exposure2012="+1.00"/></x:xmpmeta>"#;
    const XMP_FOR_CR2: &[u8] =
        br#"<x:xmpmeta><rdf:Description photoshop:SidecarForExtension="CR2"/></x:xmpmeta>"#;
    const XMP_UNTAGGED: &[u8] =
        br#"<x:xmpmeta><rdf:Description crs:Exposure2012="+2.00"/></x:xmpmeta>"#;

    fn photo(dir: &TempDir, name: &str) -> PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, b"raw").unwrap();
        p
    }

    // ── extension guard ──────────────────────────────────────────────

    #[test]
    fn guard_attribute_form() {
        assert!(is_sidecar_for_ext(XMP_FOR_NEF, "nef"));
        assert!(is_sidecar_for_ext(XMP_FOR_NEF, ".NEF"));
        assert!(!is_sidecar_for_ext(XMP_FOR_NEF, "CR2"));
    }

    #[test]
    fn guard_element_form() {
        let xmp = b"<photoshop:SidecarForExtension> ARW </photoshop:SidecarForExtension>";
        assert!(is_sidecar_for_ext(xmp, "arw"));
        assert!(!is_sidecar_for_ext(xmp, "nef"));
    }

    #[test]
    fn guard_accepts_undeclared() {
        assert!(is_sidecar_for_ext(XMP_UNTAGGED, "NEF"));
        assert!(is_sidecar_for_ext(b"", "NEF"));
    }

    #[test]
    fn sidecar_names() {
        let p = Path::new("/photos/DSC_1.NEF");
        assert_eq!(plain_sidecar(p), Some(PathBuf::from("/photos/DSC_1.xmp")));
        assert_eq!(qualified_sidecar(p), PathBuf::from("/photos/DSC_1.NEF.xmp"));
        assert_eq!(plain_sidecar(Path::new("/photos/noext")), None);
    }

    // ── read precedence ──────────────────────────────────────────────

    #[test]
    fn read_prefers_matching_plain_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.xmp"), XMP_FOR_NEF).unwrap();
        fs::write(dir.path().join("a.NEF.xmp"), XMP_UNTAGGED).unwrap();

        let got = read_source(&p).unwrap();
        assert_eq!(
            got,
            ReadSource::Sidecar {
                path: dir.path().join("a.xmp"),
                contents: XMP_FOR_NEF.to_vec()
            }
        );
    }

    #[test]
    fn read_skips_foreign_plain_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.xmp"), XMP_FOR_CR2).unwrap();
        fs::write(dir.path().join("a.NEF.xmp"), XMP_UNTAGGED).unwrap();

        match read_source(&p).unwrap() {
            ReadSource::Sidecar { path, .. } => assert_eq!(path, dir.path().join("a.NEF.xmp")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_falls_back_to_embedded() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.xmp"), XMP_FOR_CR2).unwrap();
        assert_eq!(read_source(&p).unwrap(), ReadSource::Embedded);
    }

    #[test]
    fn read_propagates_other_errors() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        // a directory where the sidecar should be
        fs::create_dir(dir.path().join("a.xmp")).unwrap();
        assert!(read_source(&p).is_err());
    }

    // ── write precedence ─────────────────────────────────────────────

    #[tokio::test]
    async fn write_new_sidecar_when_nothing_exists() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        let tool = RecordingTool::replying(b"");

        let dest = write_destination(&tool, &p).await.unwrap();
        assert_eq!(dest, dir.path().join("a.xmp"));
        assert!(!dest.exists());
        // not a DNG: no content probe
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn write_propagates_other_errors() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::create_dir(dir.path().join("a.xmp")).unwrap();
        let tool = RecordingTool::replying(b"");

        let err = write_destination(&tool, &p).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn write_to_existing_qualified_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.NEF.xmp"), XMP_FOR_CR2).unwrap();
        let tool = RecordingTool::replying(b"");

        let dest = write_destination(&tool, &p).await.unwrap();
        assert_eq!(dest, dir.path().join("a.NEF.xmp"));
    }

    #[tokio::test]
    async fn write_never_takes_over_foreign_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.xmp"), XMP_FOR_CR2).unwrap();
        let tool = RecordingTool::replying(b"");

        let dest = write_destination(&tool, &p).await.unwrap();
        assert_eq!(dest, dir.path().join("a.NEF.xmp"));
    }

    #[tokio::test]
    async fn write_into_edited_dng() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.dng");
        let tool = RecordingTool::replying(b"History : saved\n");

        assert_eq!(write_destination(&tool, &p).await.unwrap(), p);
    }

    #[tokio::test]
    async fn write_unedited_dng_gets_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.DNG");
        let tool = RecordingTool::replying(b"");

        assert_eq!(write_destination(&tool, &p).await.unwrap(), dir.path().join("a.xmp"));
        assert_eq!(tool.calls().len(), 1);
    }

    #[tokio::test]
    async fn external_sidecar_beats_edited_dng() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.dng");
        fs::write(dir.path().join("a.xmp"), XMP_UNTAGGED).unwrap();
        let tool = RecordingTool::replying(b"History : saved\n");

        assert_eq!(write_destination(&tool, &p).await.unwrap(), dir.path().join("a.xmp"));
        assert_eq!(
            read_source(&p).unwrap(),
            ReadSource::Sidecar {
                path: dir.path().join("a.xmp"),
                contents: XMP_UNTAGGED.to_vec()
            }
        );
        assert!(tool.calls().is_empty());
    }

    // ── staging ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn stage_copies_winning_sidecar() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        fs::write(dir.path().join("a.xmp"), XMP_FOR_NEF).unwrap();
        let dst = dir.path().join("orig.xmp");

        stage(&RecordingTool::replying(b"unused"), &p, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).unwrap(), XMP_FOR_NEF);
    }

    #[tokio::test]
    async fn stage_extracts_embedded_or_clears() {
        let dir = TempDir::new().unwrap();
        let p = photo(&dir, "a.NEF");
        let dst = dir.path().join("orig.xmp");

        stage(&RecordingTool::replying(XMP_UNTAGGED), &p, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).unwrap(), XMP_UNTAGGED);

        stage(&RecordingTool::replying(b""), &p, &dst).await.unwrap();
        assert!(!dst.exists());
    }
}
