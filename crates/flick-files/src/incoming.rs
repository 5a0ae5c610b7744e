//! Incoming directory: where received files are created.

use crate::names::{candidate_name, sanitize_file_name};
use crate::INCOMING_DIR_NAME;
use flick_core::{
    ContentStore, Destination, FlickError, Result, SourceFile, TransferHandle, fallback_filename,
};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Candidates tried before giving up on a name
const MAX_ATTEMPTS: u32 = 1000;

/// Directory-backed [`ContentStore`]
///
/// The directory is created on first use. An existing file is never
/// overwritten: a clash yields `name (1).ext`, `name (2).ext`, and so on.
#[derive(Debug, Clone)]
pub struct IncomingDir {
    root: PathBuf,
}

impl Default for IncomingDir {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

impl IncomingDir {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<Downloads>/FlickShare`, falling back to the home or current
    /// directory when the platform has no downloads folder
    pub fn default_root() -> PathBuf {
        dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(INCOMING_DIR_NAME)
    }

    /// Directory files are created in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new file for `display_name`, picking a free name
    ///
    /// # Errors
    ///
    /// Returns the I/O error that stopped creation, or `AlreadyExists` when
    /// every candidate name is taken.
    pub fn create_new(&self, display_name: &str) -> io::Result<(File, PathBuf)> {
        fs::create_dir_all(&self.root)?;

        let mut base = sanitize_file_name(display_name);
        if base.is_empty() {
            base = fallback_filename(SystemTime::now());
            debug!(requested = display_name, generated = %base, "Using generated file name");
        }

        for attempt in 0..MAX_ATTEMPTS {
            let path = self.root.join(candidate_name(&base, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {base} after {MAX_ATTEMPTS} attempts"),
        ))
    }
}

impl ContentStore for IncomingDir {
    fn open_source(&self, path: &Path) -> Result<SourceFile> {
        let failed = |reason: String| FlickError::SourceOpenFailed {
            path: path.display().to_string(),
            reason,
        };

        let metadata = fs::metadata(path).map_err(|e| failed(e.to_string()))?;
        if !metadata.is_file() {
            return Err(failed("not a regular file".into()));
        }
        let file = File::open(path).map_err(|e| failed(e.to_string()))?;

        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| fallback_filename(SystemTime::now()));

        debug!(path = %path.display(), size = metadata.len(), "Source opened");
        Ok(SourceFile {
            handle: TransferHandle::new(file),
            display_name,
        })
    }

    fn create_destination(&self, display_name: &str) -> Result<Destination> {
        let (file, path) =
            self.create_new(display_name)
                .map_err(|e| FlickError::DestinationCreateFailed {
                    name: display_name.to_string(),
                    reason: e.to_string(),
                })?;

        info!(path = %path.display(), "Destination created");
        Ok(Destination {
            handle: TransferHandle::new(file),
            location: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn store() -> (TempDir, IncomingDir) {
        let dir = TempDir::new().unwrap();
        let store = IncomingDir::new(dir.path().join("FlickShare"));
        (dir, store)
    }

    #[test]
    fn test_creates_directory_on_demand() {
        let (_dir, store) = store();
        assert!(!store.root().exists());

        let destination = store.create_destination("photo.jpg").unwrap();
        assert!(store.root().is_dir());
        assert!(destination.location.ends_with("photo.jpg"));
    }

    #[test]
    fn test_never_overwrites() {
        let (_dir, store) = store();
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("photo.jpg"), b"keep me").unwrap();

        let first = store.create_destination("photo.jpg").unwrap();
        let second = store.create_destination("photo.jpg").unwrap();

        assert!(first.location.ends_with("photo (1).jpg"));
        assert!(second.location.ends_with("photo (2).jpg"));
        assert_eq!(fs::read(store.root().join("photo.jpg")).unwrap(), b"keep me");
    }

    #[test]
    fn test_traversal_stays_inside_root() {
        let (_dir, store) = store();
        let destination = store.create_destination("../../escape.txt").unwrap();

        let path = PathBuf::from(&destination.location);
        assert_eq!(path.parent().unwrap(), store.root());
        assert_eq!(path.file_name().unwrap(), "escape.txt");
    }

    #[test]
    fn test_empty_name_is_generated() {
        let (_dir, store) = store();
        let destination = store.create_destination("..").unwrap();

        let path = PathBuf::from(&destination.location);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("file_"));
    }

    #[test]
    fn test_destination_is_writable() {
        let (_dir, store) = store();
        let destination = store.create_destination("notes.txt").unwrap();

        let mut file = destination.handle.into_file();
        file.write_all(b"hello").unwrap();
        drop(file);
        assert_eq!(fs::read(&destination.location).unwrap(), b"hello");
    }

    #[test]
    fn test_unusable_root_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("occupied");
        fs::write(&blocker, b"").unwrap();

        let err = IncomingDir::new(&blocker)
            .create_destination("photo.jpg")
            .unwrap_err();
        assert!(matches!(err, FlickError::DestinationCreateFailed { ref name, .. } if name == "photo.jpg"));
    }

    #[test]
    fn test_open_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        let source = IncomingDir::new(dir.path()).open_source(&path).unwrap();
        assert_eq!(source.display_name, "report.pdf");
        assert_eq!(source.handle.probe_size().unwrap(), 2048);
    }

    #[test]
    fn test_open_source_rejects_directories_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = IncomingDir::new(dir.path());

        assert!(matches!(
            store.open_source(dir.path()),
            Err(FlickError::SourceOpenFailed { .. })
        ));
        assert!(matches!(
            store.open_source(&dir.path().join("missing.bin")),
            Err(FlickError::SourceOpenFailed { .. })
        ));
    }

    #[test]
    fn test_default_root_name() {
        assert!(IncomingDir::default_root().ends_with(INCOMING_DIR_NAME));
    }
}
