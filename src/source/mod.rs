//! Shared-memory image source and sink interfaces.
//!
//! A producer process writes frames into a named ring buffer of image
//! slices. The publisher reads from such buffers through [`ImageSource`] and
//! the subscriber writes received frames into local ones through
//! [`ImageSink`]. Handles close their image when dropped.
//!
//! [`memory::ImageStore`] implements both sides in process.

pub mod memory;

pub use memory::{ImageReader, ImageStore, ImageWriter};

use crate::Result;
use crate::types::{FrameShape, Timestamp};

/// Snapshot of an open image's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStatus {
    pub shape: FrameShape,
    /// Incremented by the producer for every written frame.
    pub frame_counter: u64,
    /// Slot most recently written, negative before the first write.
    pub write_cursor: i64,
    pub timestamp: Timestamp,
    /// False once the producer crashed or removed the image.
    pub semaphore_valid: bool,
}

impl SourceStatus {
    /// Slot holding the newest slice.
    ///
    /// Cubes use the write cursor, falling back to the last slot before the
    /// first write. Flat images always use slot 0.
    pub fn current_slot(&self) -> usize {
        if !self.shape.is_cube() {
            return 0;
        }
        let last = self.shape.slots() - 1;
        usize::try_from(self.write_cursor).map(|c| c.min(last)).unwrap_or(last)
    }
}

/// Catalog of readable images.
pub trait ImageSource: Send + Sync + 'static {
    type Handle: SourceHandle;

    /// Open an image by name.
    ///
    /// Fails with `SourceNotFound` when no such image exists and with
    /// `SourceNotReady` when it exists but its producer has not finished
    /// initializing it.
    fn open(&self, name: &str) -> Result<Self::Handle>;

    /// Names of all images currently available.
    fn list(&self) -> Vec<String>;
}

/// An open image. Dropping the handle closes it.
pub trait SourceHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn status(&self) -> SourceStatus;

    /// Copy slice `slot` into `out`, which must be exactly one slice long.
    fn read_slice(&self, slot: usize, out: &mut [u8]) -> Result<()>;
}

/// Factory for writable images.
pub trait ImageSink: Send + Sync + 'static {
    type Handle: SinkHandle;

    /// Create (or replace) a flat image called `name`.
    fn create(&self, name: &str, shape: FrameShape) -> Result<Self::Handle>;
}

/// A writable image. Dropping the handle destroys it.
pub trait SinkHandle: Send + 'static {
    fn shape(&self) -> FrameShape;

    /// Overwrite the image contents and metadata.
    fn write_slice(&mut self, data: &[u8], frame_counter: u64, timestamp: Timestamp)
    -> Result<()>;

    /// Wake every reader waiting for an update.
    fn notify_readers(&self);
}
