use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::MetadataTool;
use crate::error::{Error, Result};

/// Line exiftool prints once a command has finished.
const READY: &[u8] = b"{ready}";

/// Arguments applied to every command.
const COMMON_ARGS: &[&str] = &[
    "-charset",
    "filename=utf8",
    "-ignoreMinorErrors",
    "-quiet",
    "-quiet",
];

/// A long-running exiftool process driven through `-stay_open`.
///
/// Started with [`ExifTool::start`] and stopped with [`ExifTool::shutdown`]; the
/// process is killed if the server is dropped without a shutdown. Commands
/// from concurrent callers are serialized: exactly one is in flight at any
/// time.
pub struct ExifTool {
    program: PathBuf,
    process: Mutex<Option<Process>>,
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

impl ExifTool {
    /// Spawn the exiftool server.
    pub async fn start(program: impl AsRef<Path>) -> Result<Self> {
        let program = program.as_ref().to_path_buf();
        let process = Process::spawn(&program)?;
        log::debug!("exiftool server started ({})", program.display());
        Ok(Self {
            program,
            process: Mutex::new(Some(process)),
        })
    }

    /// Ask exiftool to exit and wait for it. Later commands fail.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        let broken = |e: std::io::Error| Error::ExifTool(format!("exiftool shutdown: {e}"));
        process
            .stdin
            .write_all(b"-stay_open\nFalse\n")
            .await
            .map_err(broken)?;
        process.stdin.flush().await.map_err(broken)?;
        let status = process.child.wait().await.map_err(broken)?;
        log::debug!("exiftool server stopped ({status})");
        Ok(())
    }
}

impl Process {
    fn spawn(program: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .args(["-stay_open", "True", "-@", "-", "-common_args"])
            .args(COMMON_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ToolStart {
                tool: program.display().to_string(),
                source,
            })?;

        let missing = || Error::ExifTool("exiftool pipes unavailable".into());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = BufReader::new(child.stdout.take().ok_or_else(missing)?);
        let stderr = BufReader::new(child.stderr.take().ok_or_else(missing)?);
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    async fn execute(&mut self, args: &[String]) -> Result<Vec<u8>> {
        let mut script = Vec::new();
        for arg in args {
            if arg.contains('\n') || arg.contains('\r') {
                return Err(Error::ExifTool(format!("argument contains a line break: {arg:?}")));
            }
            script.extend_from_slice(arg.as_bytes());
            script.push(b'\n');
        }
        // -echo4 marks the end of the error stream for this command
        script.extend_from_slice(b"-echo4\n{ready}\n-execute\n");

        let broken = |e: std::io::Error| Error::ExifTool(format!("exiftool pipe: {e}"));
        self.stdin.write_all(&script).await.map_err(broken)?;
        self.stdin.flush().await.map_err(broken)?;

        let Self { stdout, stderr, .. } = self;
        let (out, err) = tokio::join!(read_until_ready(stdout), read_until_ready(stderr));
        let (out, err) = (out?, err?);

        let err = String::from_utf8_lossy(&err);
        let err = err.trim();
        if !err.is_empty() {
            return Err(Error::ExifTool(err.to_string()));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl MetadataTool for ExifTool {
    async fn command(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut guard = self.process.lock().await;
        let process = guard
            .as_mut()
            .ok_or_else(|| {
                Error::ExifTool(format!("{} is not running", self.program.display()))
            })?;
        process.execute(args).await
    }
}

/// Read one command's output, up to and excluding the `{ready}` line.
async fn read_until_ready<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| Error::ExifTool(format!("exiftool pipe: {e}")))?;
        if n == 0 {
            return Err(Error::ExifTool("exiftool exited unexpectedly".into()));
        }

        let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.ends_with(READY) {
            let keep = line.len() - READY.len();
            buf.truncate(keep);
            return Ok(buf);
        }
    }
}
