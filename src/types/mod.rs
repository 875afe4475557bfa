//! Core types describing image streams.
//!
//! - [`ElementType`] maps the shared-memory pixel type codes to sizes
//! - [`FrameShape`] is the geometry of a stream (width, height, ring depth, type)
//! - [`StreamDescriptor`] is the per-frame identity carried in the wire header
//! - [`Timestamp`] is the acquisition time of a frame
//!
//! ## Usage Example
//!
//! ```rust
//! use framerelay::types::{ElementType, FrameShape};
//!
//! let shape = FrameShape::cube(64, 48, 4, ElementType::UInt16);
//! assert_eq!(shape.slice_len(), 64 * 48 * 2);
//! assert_eq!(shape.slots(), 4);
//! ```

mod descriptor;
mod element_type;

pub use descriptor::{FrameShape, StreamDescriptor, Timestamp};
pub use element_type::ElementType;
