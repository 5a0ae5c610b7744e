//! Transfer handles: the open file a single transfer reads from or writes to.

use crate::error::{FlickError, Result};
use std::fs::File;
use std::io::Seek;

/// An already-open, positioned file scoped to exactly one transfer
///
/// Engines take the handle by value, so it cannot be reused once an engine
/// call returns. The core never reads the content itself.
#[derive(Debug)]
pub struct TransferHandle {
    file: File,
}

impl TransferHandle {
    /// Wrap an open file
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Take ownership of a raw file descriptor handed over by a host process
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that nothing else will close or use
    /// afterwards. The handle closes it when dropped.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(fd: std::os::fd::RawFd) -> Self {
        use std::os::fd::FromRawFd;
        // SAFETY: ownership of `fd` is transferred by the caller.
        Self::new(unsafe { File::from_raw_fd(fd) })
    }

    /// Bytes between the current position and the end of the file
    ///
    /// This is what an engine will stream. The position is left untouched.
    /// A handle that cannot report its position (a pipe, say) probes as 0,
    /// the "unknown size" value.
    ///
    /// # Errors
    ///
    /// Returns [`FlickError::SizeProbeFailed`] when metadata is unavailable,
    /// e.g. for revoked descriptors.
    pub fn probe_size(&self) -> Result<u64> {
        let len = self
            .file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| FlickError::SizeProbeFailed(e.to_string()))?;
        match (&self.file).stream_position() {
            Ok(position) => Ok(len.saturating_sub(position)),
            Err(_) => Ok(0),
        }
    }

    /// Give up the handle and return the file for engine I/O
    pub fn into_file(self) -> File {
        self.file
    }
}

impl From<File> for TransferHandle {
    fn from(file: File) -> Self {
        Self::new(file)
    }
}
