//! Bridge to the external metadata editor (exiftool).
//!
//! - [`MetadataTool`]: one command in, raw output out
//! - [`ExifTool`]: a persistent `-stay_open` exiftool process, one command in flight at a time
//! - [`commands`]: the specific commands the edit pipeline relies on

pub mod commands;
mod server;

pub use server::ExifTool;

use crate::error::Result;

/// Something that runs exiftool-style commands.
///
/// Implementations must be safe to call from many tasks at once; the
/// [`ExifTool`] server queues callers behind a lock.
#[async_trait::async_trait]
pub trait MetadataTool: Send + Sync {
    /// Run one command and return its standard output.
    ///
    /// Anything the tool reports on its error stream fails the call.
    async fn command(&self, args: &[String]) -> Result<Vec<u8>>;
}
