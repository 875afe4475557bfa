//! Fixed-size frame header.
//!
//! Every frame message starts with a 256-byte header followed by the encoded
//! payload. All multi-byte integers are little-endian.
//!
//! ```text
//! offset  size  field
//!      0   128  stream name, UTF-8, null padded, always null terminated
//!    128     1  element type code
//!    129     4  width (u32)
//!    133     4  height (u32)
//!    137     8  frame counter (u64)
//!    145     8  acquisition time, seconds (u64)
//!    153     8  acquisition time, nanoseconds (u64)
//!    161     2  difference method (i16)
//!    163     2  reorder method (i16)
//!    165     2  compress method (i16)
//!    167     4  payload length in bytes (u32)
//!    171    85  reserved, zero
//! ```

use tracing::trace;

use crate::codec::{CodecParams, CompressMethod, DifferenceMethod, ReorderMethod};
use crate::types::{ElementType, StreamDescriptor, Timestamp};
use crate::{RelayError, Result};

/// Total header size in bytes.
pub const HEADER_SIZE: usize = 256;

/// Size of the null-padded name field.
pub const NAME_FIELD_LEN: usize = 128;

/// Longest name that still leaves room for the terminating null.
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

pub const ELEMENT_TYPE_OFFSET: usize = 128;
pub const WIDTH_OFFSET: usize = 129;
pub const HEIGHT_OFFSET: usize = 133;
pub const FRAME_COUNTER_OFFSET: usize = 137;
pub const TIMESTAMP_SECS_OFFSET: usize = 145;
pub const TIMESTAMP_NANOS_OFFSET: usize = 153;
pub const DIFFERENCE_OFFSET: usize = 161;
pub const REORDER_OFFSET: usize = 163;
pub const COMPRESS_OFFSET: usize = 165;
pub const PAYLOAD_LEN_OFFSET: usize = 167;

/// First byte after the assigned fields.
const ASSIGNED_END: usize = PAYLOAD_LEN_OFFSET + 4;

const _: () = {
    assert!(ELEMENT_TYPE_OFFSET == NAME_FIELD_LEN);
    assert!(WIDTH_OFFSET == ELEMENT_TYPE_OFFSET + 1);
    assert!(HEIGHT_OFFSET == WIDTH_OFFSET + 4);
    assert!(FRAME_COUNTER_OFFSET == HEIGHT_OFFSET + 4);
    assert!(TIMESTAMP_SECS_OFFSET == FRAME_COUNTER_OFFSET + 8);
    assert!(TIMESTAMP_NANOS_OFFSET == TIMESTAMP_SECS_OFFSET + 8);
    assert!(DIFFERENCE_OFFSET == TIMESTAMP_NANOS_OFFSET + 8);
    assert!(REORDER_OFFSET == DIFFERENCE_OFFSET + 2);
    assert!(COMPRESS_OFFSET == REORDER_OFFSET + 2);
    assert!(PAYLOAD_LEN_OFFSET == COMPRESS_OFFSET + 2);
    assert!(ASSIGNED_END <= HEADER_SIZE);
};

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub descriptor: StreamDescriptor,
    pub params: CodecParams,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(descriptor: StreamDescriptor, params: CodecParams, payload_len: u32) -> Self {
        Self { descriptor, params, payload_len }
    }

    /// Serialize the header into its 256-byte wire form.
    ///
    /// Names longer than [`MAX_NAME_LEN`] bytes are truncated at the last
    /// character boundary that fits.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        let buf = &mut buf[..HEADER_SIZE];
        buf.fill(0);

        let name = truncate_name(&self.descriptor.name);
        buf[..name.len()].copy_from_slice(name.as_bytes());

        let d = &self.descriptor;
        buf[ELEMENT_TYPE_OFFSET] = d.element_type.code();
        put(buf, WIDTH_OFFSET, &d.width.to_le_bytes());
        put(buf, HEIGHT_OFFSET, &d.height.to_le_bytes());
        put(buf, FRAME_COUNTER_OFFSET, &d.frame_counter.to_le_bytes());
        put(buf, TIMESTAMP_SECS_OFFSET, &d.timestamp.secs.to_le_bytes());
        put(buf, TIMESTAMP_NANOS_OFFSET, &d.timestamp.nanos.to_le_bytes());
        put(buf, DIFFERENCE_OFFSET, &self.params.difference.code().to_le_bytes());
        put(buf, REORDER_OFFSET, &self.params.reorder.code().to_le_bytes());
        put(buf, COMPRESS_OFFSET, &self.params.compress.code().to_le_bytes());
        put(buf, PAYLOAD_LEN_OFFSET, &self.payload_len.to_le_bytes());
    }

    /// Parse the header at the start of `message`.
    ///
    /// Only the first [`HEADER_SIZE`] bytes are read. The payload length is
    /// checked against the message by [`WireFrame::parse`](super::WireFrame::parse).
    pub fn decode(message: &[u8]) -> Result<Self> {
        if message.len() < HEADER_SIZE {
            return Err(RelayError::malformed_header(format!(
                "message of {} bytes is shorter than the {} byte header",
                message.len(),
                HEADER_SIZE
            )));
        }

        let name_field = &message[..NAME_FIELD_LEN];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|e| RelayError::malformed_header(format!("stream name is not UTF-8: {}", e)))?
            .to_string();

        let type_code = message[ELEMENT_TYPE_OFFSET];
        let element_type = ElementType::from_code(type_code).ok_or_else(|| {
            RelayError::malformed_header(format!("unknown element type code {}", type_code))
        })?;

        let difference_code = read_i16(message, DIFFERENCE_OFFSET);
        let reorder_code = read_i16(message, REORDER_OFFSET);
        let compress_code = read_i16(message, COMPRESS_OFFSET);
        let params = CodecParams {
            difference: DifferenceMethod::from_code(difference_code).ok_or_else(|| {
                RelayError::malformed_header(format!("unknown difference method {}", difference_code))
            })?,
            reorder: ReorderMethod::from_code(reorder_code).ok_or_else(|| {
                RelayError::malformed_header(format!("unknown reorder method {}", reorder_code))
            })?,
            compress: CompressMethod::from_code(compress_code).ok_or_else(|| {
                RelayError::malformed_header(format!("unknown compress method {}", compress_code))
            })?,
        };

        let payload_len = read_u32(message, PAYLOAD_LEN_OFFSET);

        let descriptor = StreamDescriptor {
            name,
            width: read_u32(message, WIDTH_OFFSET),
            height: read_u32(message, HEIGHT_OFFSET),
            element_type,
            frame_counter: read_u64(message, FRAME_COUNTER_OFFSET),
            timestamp: Timestamp::new(
                read_u64(message, TIMESTAMP_SECS_OFFSET),
                read_u64(message, TIMESTAMP_NANOS_OFFSET),
            ),
        };

        trace!(
            stream = %descriptor.name,
            counter = descriptor.frame_counter,
            payload_len,
            "Decoded frame header"
        );

        Ok(Self { descriptor, params, payload_len })
    }
}

/// Longest prefix of `name` that fits the name field with a null terminator.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn read_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
