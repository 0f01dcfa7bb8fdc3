//! File primitives that never expose a half-written file at a public path.
//!
//! Every write lands in a temporary file inside the destination's directory
//! (same device, so the final rename is atomic). Moves that cross a device
//! boundary fall back to an atomic copy followed by removal of the source.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::{Error, IoContext, Result};

/// Upper bound on `name (n).ext` probes.
pub const MAX_NAME_ATTEMPTS: usize = 9999;

#[cfg(windows)]
const NOT_SAME_DEVICE: i32 = 17; // ERROR_NOT_SAME_DEVICE
#[cfg(not(windows))]
const NOT_SAME_DEVICE: i32 = 18; // EXDEV

static NUMBERED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A(.*?)(?: \((\d{1,4})\))?(\.\w*)?\z").expect("valid regex")
});

fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices || err.raw_os_error() == Some(NOT_SAME_DEVICE)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn temp_beside(dest: &Path) -> Result<NamedTempFile> {
    let dir = parent_dir(dest);
    tempfile::Builder::new()
        .prefix(".darkroom-")
        .suffix(".part")
        .tempfile_in(dir)
        .at(dir)
}

/// Copy `src` to `dst`; `dst` is replaced atomically.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let mut input = fs::File::open(src).at(src)?;
    let mut tmp = temp_beside(dst)?;
    io::copy(&mut input, tmp.as_file_mut()).at(dst)?;
    tmp.as_file_mut().flush().at(dst)?;
    tmp.persist(dst).map_err(|e| Error::io(dst, e.error))?;
    Ok(())
}

/// Write `data` to `dst`; `dst` is replaced atomically.
pub fn write_file(dst: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = temp_beside(dst)?;
    tmp.write_all(data).at(dst)?;
    tmp.flush().at(dst)?;
    tmp.persist(dst).map_err(|e| Error::io(dst, e.error))?;
    Ok(())
}

/// Rename `src` to `dst`, falling back to copy-then-delete across devices.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    move_file_with(src, dst, |a, b| fs::rename(a, b))
}

pub(crate) fn move_file_with<F>(src: &Path, dst: &Path, rename: F) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            log::debug!(
                "rename crosses devices, copying {} to {}",
                src.display(),
                dst.display()
            );
            copy_file(src, dst)?;
            match fs::remove_file(src) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(src, e)),
                _ => Ok(()),
            }
        }
        Err(e) => Err(Error::io(dst, e)),
    }
}

/// Hard-link `src` at `dst`, copying instead when they live on different devices.
///
/// A copy keeps the source's modification time so freshness checks agree
/// with a link.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match fs::remove_file(dst) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(Error::io(dst, e)),
        _ => {}
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            copy_file(src, dst)?;
            let modified = fs::metadata(src).and_then(|m| m.modified()).at(src)?;
            let file = fs::OpenOptions::new().write(true).open(dst).at(dst)?;
            file.set_modified(modified).at(dst)
        }
        Err(e) => Err(Error::io(dst, e)),
    }
}

/// Staging name next to `dest`, on the same device.
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Promote `src` over `dest`: stage beside `dest`, then rename into place.
///
/// With `keep_src` the source is copied rather than moved.
pub fn publish_file(src: &Path, dest: &Path, keep_src: bool) -> Result<()> {
    let staged = staging_path(dest);
    if keep_src {
        copy_file(src, &staged)?;
    } else {
        move_file(src, &staged)?;
    }
    if let Err(e) = fs::rename(&staged, dest) {
        let _ = fs::remove_file(&staged);
        return Err(Error::io(dest, e));
    }
    Ok(())
}

/// Pick the first name in `desired`, `desired (1)`, `desired (2)`, … that
/// `exists` rejects, trying at most `max_attempts` names.
///
/// A trailing ` (n)` already present in `desired` is incremented in place.
pub fn next_free_name(
    desired: &Path,
    exists: impl Fn(&Path) -> bool,
    max_attempts: usize,
) -> Option<PathBuf> {
    let dir = desired.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut name = desired.file_name()?.to_string_lossy().into_owned();

    for _ in 0..max_attempts {
        let candidate = dir.join(&name);
        if !exists(&candidate) {
            return Some(candidate);
        }
        let caps = NUMBERED_NAME.captures(&name)?;
        let stem = caps.get(1).map_or("", |m| m.as_str());
        let n: u32 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let ext = caps.get(3).map_or("", |m| m.as_str());
        name = format!("{stem} ({}){ext}", n + 1);
    }
    None
}

/// Atomically create a new file near `desired` holding `data`, never
/// replacing an existing file. Returns the chosen path.
pub fn publish_new(desired: &Path, data: &[u8]) -> Result<PathBuf> {
    let mut tmp = temp_beside(desired)?;
    tmp.write_all(data).at(desired)?;
    tmp.flush().at(desired)?;

    for _ in 0..MAX_NAME_ATTEMPTS {
        let name = next_free_name(desired, Path::exists, MAX_NAME_ATTEMPTS)
            .ok_or_else(|| Error::NoFreeName(desired.to_path_buf()))?;
        match tmp.persist_noclobber(&name) {
            Ok(_) => return Ok(name),
            // lost a race for this name; probe again
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => return Err(Error::io(&name, e.error)),
        }
    }
    Err(Error::NoFreeName(desired.to_path_buf()))
}
