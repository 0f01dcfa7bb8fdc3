//! Per-photo scratch directories.
//!
//! Every photo gets a directory under the workspace root, named after a hash
//! of its path so that repeated operations find the same edit cache. The
//! directory holds:
//!
//! | file | contents |
//! |---|---|
//! | `orig.EXT` | hard link to (or copy of) the source photo |
//! | `orig.xmp` | working sidecar, read by the converter next to `orig.EXT` |
//! | `edit.dng` | downscaled DNG reused across previews |
//! | `pixels` | raw pixel sample for white balance picking |
//! | `scratch-N.*` | private conversion targets of one handle |
//! | `manifest.json` | source fingerprint and last use |
//!
//! A source whose size or modification time changed since the directory was
//! populated resets it, so caches never outlive the file they were built
//! from.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{IoContext, Result};
use crate::exif::MetadataTool;
use crate::{fsutil, sidecar};

const MANIFEST: &str = "manifest.json";
const WORKING_XMP: &str = "orig.xmp";
const EDIT_CACHE: &str = "edit.dng";
const PIXEL_CACHE: &str = "pixels";

/// Length of a workspace directory name.
const DIR_NAME_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Fingerprint {
    source: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(flatten)]
    fingerprint: Fingerprint,
    used: SystemTime,
}

fn read_manifest(dir: &Path) -> Option<Manifest> {
    let data = fs::read(dir.join(MANIFEST)).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Directory name for a photo: a truncated, URL-safe hash of its path.
fn dir_name(photo: &Path) -> String {
    let digest = Sha256::digest(photo.as_os_str().as_encoded_bytes());
    let mut name = URL_SAFE_NO_PAD.encode(digest);
    name.truncate(DIR_NAME_LEN);
    name
}

/// Remove everything inside `dir`, keeping the directory itself.
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).at(&path)?;
        } else {
            fs::remove_file(&path).at(&path)?;
        }
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {e}", path.display());
        }
    }
}

/// Process-wide registry of workspaces.
///
/// Hands out at most one [`Workspace`] per photo at a time; a second
/// `open` for the same photo waits until the first handle is closed.
pub struct Workspaces {
    root: PathBuf,
    max_workspaces: usize,
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
    next_scratch: AtomicU64,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>, max_workspaces: usize) -> Self {
        Self {
            root: root.into(),
            max_workspaces: max_workspaces.max(1),
            locks: Mutex::new(HashMap::new()),
            next_scratch: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds the workspace of `photo`.
    pub fn dir_for(&self, photo: &Path) -> Result<PathBuf> {
        let photo = std::path::absolute(photo).at(photo)?;
        Ok(self.root.join(dir_name(&photo)))
    }

    fn lock_for(&self, dir: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Open the workspace of `photo`, bringing it up to date with the
    /// source and staging the photo's current metadata as the working
    /// sidecar.
    pub async fn open(&self, meta: &dyn MetadataTool, photo: &Path) -> Result<Workspace> {
        let photo = std::path::absolute(photo).at(photo)?;
        let dir = self.root.join(dir_name(&photo));
        let guard = self.lock_for(&dir).lock_owned().await;

        fs::create_dir_all(&dir).at(&dir)?;
        let stat = fs::metadata(&photo).at(&photo)?;
        let origin = match photo.extension() {
            Some(ext) => dir.join(format!("orig.{}", ext.to_string_lossy())),
            None => dir.join("orig"),
        };

        let fingerprint = Fingerprint {
            source: photo.clone(),
            len: stat.len(),
            modified: stat.modified().ok(),
        };
        let fresh = read_manifest(&dir).is_some_and(|m| m.fingerprint == fingerprint);
        if !fresh || !origin.exists() {
            log::debug!("resetting workspace {} for {}", dir.display(), photo.display());
            clear_dir(&dir)?;
            fsutil::link_or_copy(&photo, &origin)?;
        }
        let manifest = Manifest {
            fingerprint,
            used: SystemTime::now(),
        };
        fsutil::write_file(&dir.join(MANIFEST), &serde_json::to_vec(&manifest)?)?;

        let working_xmp = dir.join(WORKING_XMP);
        sidecar::stage(meta, &photo, &working_xmp).await?;

        let n = self.next_scratch.fetch_add(1, Ordering::Relaxed);
        let ws = Workspace {
            has_edit_cache: dir.join(EDIT_CACHE).is_file(),
            has_pixel_cache: dir.join(PIXEL_CACHE).is_file(),
            scratch: dir.join(format!("scratch-{n}.dng")),
            scratch_jpeg: dir.join(format!("scratch-{n}.jpg")),
            working_xmp,
            origin,
            photo,
            dir,
            _guard: guard,
        };
        self.evict(&ws.dir);
        Ok(ws)
    }

    /// Remove the least recently used workspace directories beyond the
    /// configured maximum. Workspaces in use are never touched.
    fn evict(&self, keep: &Path) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot list {}: {e}", self.root.display());
                return;
            }
        };
        let mut dirs: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .map(|p| {
                let used = read_manifest(&p).map_or(SystemTime::UNIX_EPOCH, |m| m.used);
                (used, p)
            })
            .collect();
        if dirs.len() <= self.max_workspaces {
            return;
        }
        dirs.sort();

        let excess = dirs.len() - self.max_workspaces;
        let victims = self.claim_victims(dirs, keep, excess);
        for (dir, held) in victims {
            log::debug!("evicting workspace {}", dir.display());
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("could not evict {}: {e}", dir.display());
            }
            self.forget_lock(&dir, held);
        }
    }

    /// Lock up to `excess` idle workspaces, oldest first. The registry mutex
    /// is released before anything is deleted.
    fn claim_victims(
        &self,
        dirs: Vec<(SystemTime, PathBuf)>,
        keep: &Path,
        excess: usize,
    ) -> Vec<(PathBuf, OwnedMutexGuard<()>)> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let mut victims = Vec::with_capacity(excess);
        for (_, dir) in dirs {
            if victims.len() == excess {
                break;
            }
            if dir == keep {
                continue;
            }
            let lock = locks.entry(dir.clone()).or_default().clone();
            if let Ok(held) = lock.try_lock_owned() {
                victims.push((dir, held));
            }
        }
        victims
    }

    fn forget_lock(&self, dir: &Path, held: OwnedMutexGuard<()>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // map + guard: nobody is waiting to open it
        if Arc::strong_count(OwnedMutexGuard::mutex(&held)) <= 2 {
            locks.remove(dir);
        }
    }
}

/// Exclusive handle on one photo's workspace.
///
/// Dropping the handle removes its scratch files; the edit cache and the
/// pixel cache stay for later operations on the same photo.
pub struct Workspace {
    dir: PathBuf,
    photo: PathBuf,
    origin: PathBuf,
    working_xmp: PathBuf,
    scratch: PathBuf,
    scratch_jpeg: PathBuf,
    has_edit_cache: bool,
    has_pixel_cache: bool,
    _guard: OwnedMutexGuard<()>,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The photo this workspace was opened for.
    pub fn photo(&self) -> &Path {
        &self.photo
    }

    /// The source photo as staged in the workspace. Never written to.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Working sidecar the converter reads alongside [`Workspace::origin`].
    pub fn working_xmp(&self) -> &Path {
        &self.working_xmp
    }

    /// Downscaled DNG with edits; only meaningful if [`Workspace::has_edit_cache`].
    pub fn edit_cache(&self) -> PathBuf {
        self.dir.join(EDIT_CACHE)
    }

    /// Whether an edit cache existed when the handle was opened.
    pub fn has_edit_cache(&self) -> bool {
        self.has_edit_cache
    }

    /// Scratch DNG private to this handle.
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Scratch JPEG private to this handle.
    pub fn scratch_jpeg(&self) -> &Path {
        &self.scratch_jpeg
    }

    pub fn pixel_cache(&self) -> PathBuf {
        self.dir.join(PIXEL_CACHE)
    }

    pub fn has_pixel_cache(&self) -> bool {
        self.has_pixel_cache
    }

    /// Release the workspace.
    pub fn close(self) {}
}

impl Drop for Workspace {
    fn drop(&mut self) {
        remove_quietly(&self.scratch);
        remove_quietly(&self.scratch_jpeg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTool;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        photos: PathBuf,
        spaces: Workspaces,
    }

    fn fixture(max: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let photos = tmp.path().join("photos");
        fs::create_dir(&photos).unwrap();
        let spaces = Workspaces::new(tmp.path().join("ws"), max);
        fs::create_dir(spaces.root()).unwrap();
        Fixture {
            _tmp: tmp,
            photos,
            spaces,
        }
    }

    fn photo(f: &Fixture, name: &str, data: &[u8]) -> PathBuf {
        let p = f.photos.join(name);
        fs::write(&p, data).unwrap();
        p
    }

    fn tool() -> RecordingTool {
        RecordingTool::replying(b"")
    }

    // ── layout ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn same_photo_same_directory() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");
        let b = photo(&f, "b.NEF", b"raw b");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        let dir_a = ws.dir().to_path_buf();
        ws.close();
        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert_eq!(ws.dir(), dir_a);
        ws.close();

        let ws = f.spaces.open(&tool(), &b).await.unwrap();
        assert_ne!(ws.dir(), dir_a);
        assert_eq!(dir_a, f.spaces.dir_for(&a).unwrap());
    }

    #[tokio::test]
    async fn origin_mirrors_source() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert_eq!(ws.origin().file_name().unwrap(), "orig.NEF");
        assert_eq!(fs::read(ws.origin()).unwrap(), b"raw a");
        assert_eq!(ws.photo(), a);
    }

    #[tokio::test]
    async fn stages_sidecar_as_working_xmp() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");
        fs::write(f.photos.join("a.xmp"), b"<x:xmpmeta/>").unwrap();

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert_eq!(fs::read(ws.working_xmp()).unwrap(), b"<x:xmpmeta/>");
    }

    // ── scratch and caches ───────────────────────────────────────────

    #[tokio::test]
    async fn scratch_is_private_and_removed_on_close() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        let first = ws.scratch().to_path_buf();
        fs::write(ws.scratch(), b"partial").unwrap();
        fs::write(ws.edit_cache(), b"cache").unwrap();
        let cache = ws.edit_cache();
        ws.close();

        assert!(!first.exists());
        assert!(cache.exists());

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert_ne!(ws.scratch(), first);
        assert!(ws.has_edit_cache());
        assert!(!ws.has_pixel_cache());
    }

    #[tokio::test]
    async fn changed_source_resets_caches() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        fs::write(ws.edit_cache(), b"cache").unwrap();
        fs::write(ws.pixel_cache(), b"pixels").unwrap();
        ws.close();

        // replace, not rewrite: the workspace may hold a hard link
        fs::remove_file(&a).unwrap();
        fs::write(&a, b"raw a, re-exported").unwrap();

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert!(!ws.has_edit_cache());
        assert!(!ws.has_pixel_cache());
        assert_eq!(fs::read(ws.origin()).unwrap(), b"raw a, re-exported");
    }

    // ── exclusivity ──────────────────────────────────────────────────

    #[tokio::test]
    async fn second_open_waits_for_first_handle() {
        let f = fixture(16);
        let a = photo(&f, "a.NEF", b"raw a");
        let t = tool();

        let held = f.spaces.open(&t, &a).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), f.spaces.open(&t, &a)).await;
        assert!(blocked.is_err());

        held.close();
        let reopened = tokio::time::timeout(Duration::from_secs(5), f.spaces.open(&t, &a)).await;
        assert!(reopened.unwrap().is_ok());
    }

    // ── eviction ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let f = fixture(1);
        let a = photo(&f, "a.NEF", b"raw a");
        let b = photo(&f, "b.NEF", b"raw b");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        let dir_a = ws.dir().to_path_buf();
        ws.close();

        let ws = f.spaces.open(&tool(), &b).await.unwrap();
        assert!(ws.dir().exists());
        assert!(!dir_a.exists());
    }

    #[tokio::test]
    async fn evicted_workspace_leaves_no_lock_and_reopens() {
        let f = fixture(1);
        let a = photo(&f, "a.NEF", b"raw a");
        let b = photo(&f, "b.NEF", b"raw b");

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        let dir_a = ws.dir().to_path_buf();
        ws.close();
        f.spaces.open(&tool(), &b).await.unwrap().close();

        assert!(!dir_a.exists());
        assert!(!f.spaces.locks.lock().unwrap().contains_key(&dir_a));

        let ws = f.spaces.open(&tool(), &a).await.unwrap();
        assert_eq!(ws.dir(), dir_a);
        assert_eq!(fs::read(ws.origin()).unwrap(), b"raw a");
    }

    #[tokio::test]
    async fn never_evicts_open_workspace() {
        let f = fixture(1);
        let a = photo(&f, "a.NEF", b"raw a");
        let b = photo(&f, "b.NEF", b"raw b");

        let held = f.spaces.open(&tool(), &a).await.unwrap();
        let other = f.spaces.open(&tool(), &b).await.unwrap();
        assert!(held.dir().exists());
        assert!(other.dir().exists());
    }
}
