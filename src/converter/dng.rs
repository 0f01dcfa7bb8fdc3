use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Converter, converter_args};
use crate::error::{Error, IoContext, Result};
use crate::settings::ExportSettings;

/// Adobe DNG Converter, run once per conversion.
pub struct DngConverter {
    program: PathBuf,
}

impl DngConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

fn remove_partial(dst: &Path) {
    if let Err(e) = std::fs::remove_file(dst) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {e}", dst.display());
        }
    }
}

#[async_trait::async_trait]
impl Converter for DngConverter {
    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        side: u32,
        export: Option<&ExportSettings>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let dir = dst.parent().unwrap_or(Path::new("."));
        let name = dst
            .file_name()
            .ok_or_else(|| Error::io(dst, std::io::ErrorKind::InvalidInput.into()))?;

        match std::fs::remove_file(dst) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(Error::io(dst, e)),
            _ => {}
        }

        let args = converter_args(side, export);
        log::debug!("dng converter {} -> {} ({})", src.display(), dst.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .arg("-d")
            .arg(dir)
            .arg("-o")
            .arg(name)
            .arg(src)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ToolStart {
                tool: self.program.display().to_string(),
                source,
            })?;

        // dropping the wait future kills the child
        let output = tokio::select! {
            output = child.wait_with_output() => output.at(&self.program)?,
            _ = cancel.cancelled() => {
                remove_partial(dst);
                return Err(Error::Cancelled);
            }
        };

        if !output.status.success() {
            remove_partial(dst);
            return Err(Error::Converter {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !dst.exists() {
            return Err(Error::Converter {
                status: output.status.to_string(),
                stderr: format!("no output written to {}", dst.display()),
            });
        }
        Ok(())
    }
}
