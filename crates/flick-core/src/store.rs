//! Content access contract: where sources come from and destinations go.

use crate::error::Result;
use crate::handle::TransferHandle;
use std::path::Path;

/// A readable source chosen by the user
#[derive(Debug)]
pub struct SourceFile {
    /// Open handle positioned at the start
    pub handle: TransferHandle,
    /// Name shown to the peer
    pub display_name: String,
}

/// A freshly created destination
#[derive(Debug)]
pub struct Destination {
    /// Writable handle
    pub handle: TransferHandle,
    /// Where the file lives, for the completion message
    pub location: String,
}

/// File-system collaborator
pub trait ContentStore: Send + Sync + 'static {
    /// Open `path` for sending
    ///
    /// # Errors
    ///
    /// Returns [`crate::FlickError::SourceOpenFailed`] when the path is not a
    /// readable regular file.
    fn open_source(&self, path: &Path) -> Result<SourceFile>;

    /// Create a new writable destination for `display_name` in the incoming
    /// location
    ///
    /// # Errors
    ///
    /// Returns [`crate::FlickError::DestinationCreateFailed`] when no file can
    /// be created.
    fn create_destination(&self, display_name: &str) -> Result<Destination>;
}
