//! Stream shape and descriptor types

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ElementType;

/// Geometry of an image stream.
///
/// `depth` is the number of ring-buffer slots. A depth of zero describes a
/// flat 2D image with a single slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub element_type: ElementType,
}

impl FrameShape {
    /// Flat 2D shape with a single slice.
    pub fn new(width: u32, height: u32, element_type: ElementType) -> Self {
        Self { width, height, depth: 0, element_type }
    }

    /// Shape with `depth` ring-buffer slots.
    pub fn cube(width: u32, height: u32, depth: u32, element_type: ElementType) -> Self {
        Self { width, height, depth, element_type }
    }

    /// Number of pixels in one slice, saturating at `usize::MAX`.
    pub fn pixels(&self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }

    /// Size in bytes of one slice, saturating at `usize::MAX`.
    ///
    /// Shapes taken off the wire go through [`FrameShape::checked_slice_len`]
    /// first.
    pub fn slice_len(&self) -> usize {
        self.pixels().saturating_mul(self.element_type.size())
    }

    /// Size in bytes of one slice, or `None` if it does not fit a `usize`.
    pub fn checked_slice_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.element_type.size())
    }

    /// Number of slices held by the image (at least one).
    pub fn slots(&self) -> usize {
        self.depth.max(1) as usize
    }

    /// Whether the image is a multi-slot ring buffer.
    pub fn is_cube(&self) -> bool {
        self.depth > 0
    }

    /// Whether two shapes carry the same 2D slice layout.
    ///
    /// Slot count is ignored because a subscriber sink is always flat.
    pub fn same_slice_layout(&self, other: &FrameShape) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.element_type == other.element_type
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.depth > 0 {
            write!(f, "{}x{}x{} {}", self.width, self.height, self.depth, self.element_type)
        } else {
            write!(f, "{}x{} {}", self.width, self.height, self.element_type)
        }
    }
}

/// Acquisition timestamp as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u64,
}

impl Timestamp {
    pub fn new(secs: u64, nanos: u64) -> Self {
        Self { secs, nanos }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { secs: since_epoch.as_secs(), nanos: since_epoch.subsec_nanos() as u64 }
    }
}

/// Identity and current position of one logical image stream, as carried in
/// every wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub element_type: ElementType,
    pub frame_counter: u64,
    pub timestamp: Timestamp,
}

impl StreamDescriptor {
    /// Flat shape described by this descriptor.
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height, self.element_type)
    }

    /// Size in bytes of the decoded pixel data.
    pub fn slice_len(&self) -> usize {
        self.shape().slice_len()
    }
}
