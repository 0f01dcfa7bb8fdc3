//! In-process stand-ins for exiftool and the DNG converter.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::converter::{Converter, converter_args};
use crate::error::{Error, Result};
use crate::exif::MetadataTool;
use crate::settings::ExportSettings;

/// Replies to every command with the same bytes and records the arguments.
pub struct RecordingTool {
    reply: Vec<u8>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingTool {
    pub fn replying(reply: &[u8]) -> Self {
        Self {
            reply: reply.to_vec(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MetadataTool for RecordingTool {
    async fn command(&self, args: &[String]) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(args.to_vec());
        Ok(self.reply.clone())
    }
}

/// Understands the commands in [`crate::exif::commands`] well enough for
/// the pipeline to round-trip settings through files on disk.
///
/// Settings are stored in the target as an exiftool `-j` document, except
/// for DNG targets, whose settings are kept in memory so the file stays
/// intact.
#[derive(Default)]
pub struct FakeExifTool {
    pub embedded_xmp: Vec<u8>,
    pub dng_history: Vec<u8>,
    pub camera_wb: Vec<u8>,
    /// Preview JPEG embedded in the staged original (`orig.*`); none when empty.
    pub origin_preview: Vec<u8>,
    /// Fail any command with an argument containing this text.
    pub fail_on: Option<String>,
    pub(crate) calls: Mutex<Vec<Vec<String>>>,
    pub(crate) in_dng: Mutex<HashMap<PathBuf, Map<String, Value>>>,
}

fn is_dng(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("dng"))
}

impl FakeExifTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose arguments include `flag`.
    pub fn calls_with(&self, flag: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.iter().any(|a| a == flag))
            .collect()
    }

    /// Settings last written into a DNG.
    pub fn dng_settings(&self, path: &Path) -> Option<Map<String, Value>> {
        self.in_dng.lock().unwrap().get(path).cloned()
    }

    /// Settings stored in `path`: in memory for DNGs, on disk otherwise.
    fn stored(&self, path: &Path) -> Result<Map<String, Value>> {
        if is_dng(path) {
            return Ok(self.dng_settings(path).unwrap_or_default());
        }
        Ok(match std::fs::read(path) {
            Ok(data) if data.starts_with(b"[") => {
                let mut all: Vec<Map<String, Value>> = serde_json::from_slice(&data)?;
                all.pop().unwrap_or_default()
            }
            _ => Map::new(),
        })
    }

    fn store(&self, target: &Path, record: Map<String, Value>) -> Result<()> {
        if is_dng(target) {
            self.in_dng.lock().unwrap().insert(target.to_path_buf(), record);
            return Ok(());
        }
        let doc = serde_json::to_vec(&vec![record])?;
        std::fs::write(target, doc).map_err(|e| Error::io(target, e))
    }

    /// `-XMP-crs:all= [-tagsFromFile SRC -XMP-crs:all]`: replace the block.
    fn reset_settings(&self, args: &[String], target: &Path) -> Result<Vec<u8>> {
        let record = match args.iter().position(|a| a == "-tagsFromFile") {
            Some(i) => self.stored(Path::new(&args[i + 1]))?,
            None => Map::new(),
        };
        self.store(target, record)?;
        Ok(Vec::new())
    }

    fn write_settings(&self, args: &[String], target: &Path) -> Result<Vec<u8>> {
        let mut record = self.stored(target)?;
        for arg in args {
            let Some((tag, value)) = arg.split_once('=') else {
                continue;
            };
            let Some((_, name)) = tag.trim_start_matches('-').split_once(':') else {
                continue;
            };
            let name = name.trim_end_matches('#');
            let value = if let Ok(i) = value.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = value.parse::<f64>() {
                Value::from(f)
            } else {
                Value::from(value)
            };
            record.insert(name.to_string(), value);
        }
        self.store(target, record)?;
        Ok(Vec::new())
    }
}

#[async_trait::async_trait]
impl MetadataTool for FakeExifTool {
    async fn command(&self, args: &[String]) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(args.to_vec());

        if let Some(needle) = &self.fail_on {
            if args.iter().any(|a| a.contains(needle.as_str())) {
                return Err(Error::ExifTool(format!("injected failure on {needle}")));
            }
        }

        let target = PathBuf::from(args.last().cloned().unwrap_or_default());
        let has = |flag: &str| args.iter().any(|a| a == flag);

        if has("-j") {
            if let Some(record) = self.dng_settings(&target) {
                return Ok(serde_json::to_vec(&vec![record])?);
            }
            return Ok(match std::fs::read(&target) {
                Ok(data) if data.starts_with(b"[") => data,
                _ => b"[{}]".to_vec(),
            });
        }
        if has("-XMP-crs:all=") {
            return self.reset_settings(args, &target);
        }
        if args.first().is_some_and(|a| a.starts_with("-XMP-crs:ProcessVersion")) {
            return self.write_settings(args, &target);
        }
        if has("-XMP-photoshop:all") {
            return Ok(self.dng_history.clone());
        }
        if has("-ExifIFD:WhiteBalance") {
            return Ok(self.camera_wb.clone());
        }
        if has("-PreviewImage") {
            let staged_origin = target
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("orig."));
            if staged_origin {
                return Ok(self.origin_preview.clone());
            }
            return std::fs::read(&target).map_err(|e| Error::io(&target, e));
        }
        if has("-XMP") {
            return Ok(self.embedded_xmp.clone());
        }
        Ok(Vec::new())
    }
}

/// One recorded conversion.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub side: u32,
    pub args: Vec<String>,
}

/// Writes `DNG[<source contents>] <flags>` to the destination.
///
/// The output nests whatever it was converted from, so a preview rendered
/// from the edit cache is distinguishable from one rendered from the
/// original.
#[derive(Default)]
pub struct FakeConverter {
    /// Written verbatim instead of the description when set.
    pub payload: Option<Vec<u8>>,
    /// Fail conversions whose source contains this text.
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
    pub(crate) count: AtomicUsize,
    pub(crate) log: Mutex<Vec<Conversion>>,
}

impl FakeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn conversions(&self) -> Vec<Conversion> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Converter for FakeConverter {
    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        side: u32,
        export: Option<&ExportSettings>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let args = converter_args(side, export);
        self.log.lock().unwrap().push(Conversion {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            side,
            args: args.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let source = std::fs::read(src).map_err(|e| Error::io(src, e))?;
        let source = String::from_utf8_lossy(&source);
        if let Some(needle) = &self.fail_on {
            if source.contains(needle.as_str()) {
                return Err(Error::Converter {
                    status: "exit status: 1".into(),
                    stderr: format!("cannot convert {}", src.display()),
                });
            }
        }

        let out = match &self.payload {
            Some(payload) => payload.clone(),
            None => format!("DNG[{source}] {}", args.join(" ")).into_bytes(),
        };
        std::fs::write(dst, out).map_err(|e| Error::io(dst, e))
    }
}

/// Settings records stored by [`FakeExifTool`], keyed by tag.
pub fn stored_settings(path: &Path) -> BTreeMap<String, Value> {
    let data = std::fs::read(path).unwrap();
    let mut all: Vec<BTreeMap<String, Value>> = serde_json::from_slice(&data).unwrap();
    all.pop().unwrap()
}
