//! Binary wire format shared by publisher and subscriber.
//!
//! Three message kinds travel over a connection:
//!
//! - **request** (subscriber to publisher): the UTF-8 name of a stream
//! - **frame** (publisher to subscriber): a [`FrameHeader`] plus payload
//! - **hangup** (publisher to subscriber): any message shorter than a header

pub mod frame;
pub mod header;

pub use frame::{FrameBuffer, HANGUP_SENTINEL, MAX_SLICE_LEN, WireFrame, hangup, is_hangup};
pub use header::{FrameHeader, HEADER_SIZE, MAX_NAME_LEN};
