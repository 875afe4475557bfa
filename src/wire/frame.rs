//! Complete wire messages: frames and the hangup sentinel

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{FrameHeader, HEADER_SIZE};
use crate::codec::CompressMethod;
use crate::{RelayError, Result};

/// Largest decoded slice a subscriber accepts.
pub const MAX_SLICE_LEN: usize = 256 * 1024 * 1024;

/// Message a publisher sends when it stops serving a stream.
///
/// Any message shorter than [`HEADER_SIZE`] is treated as a hangup, this is
/// simply the canonical one.
pub const HANGUP_SENTINEL: &[u8] = &[0];

/// Shared handle to the hangup sentinel.
pub fn hangup() -> Bytes {
    Bytes::from_static(HANGUP_SENTINEL)
}

/// Whether a received message is a hangup rather than a frame.
pub fn is_hangup(message: &[u8]) -> bool {
    message.len() < HEADER_SIZE
}

/// A decoded frame message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub header: FrameHeader,
    /// Encoded pixel data, exactly `header.payload_len` bytes.
    pub payload: Bytes,
}

impl WireFrame {
    /// Split a received message into header and payload.
    ///
    /// Fails with [`RelayError::ShortMessage`] for hangups and any other
    /// undersized message. Fails with [`RelayError::MalformedHeader`] when the
    /// header does not decode, the payload is shorter than declared, or the
    /// declared shape is too large or disagrees with an uncompressed payload.
    /// Nothing is sized from the header before these checks pass.
    pub fn parse(message: Bytes) -> Result<Self> {
        if is_hangup(&message) {
            return Err(RelayError::ShortMessage { len: message.len(), expected: HEADER_SIZE });
        }
        let header = FrameHeader::decode(&message)?;

        let payload_len = header.payload_len as usize;
        let available = message.len() - HEADER_SIZE;
        if payload_len > available {
            return Err(RelayError::malformed_header(format!(
                "payload length {} exceeds the {} bytes after the header",
                payload_len, available
            )));
        }

        let shape = header.descriptor.shape();
        let slice_len = match shape.checked_slice_len() {
            Some(len) if len <= MAX_SLICE_LEN => len,
            _ => {
                return Err(RelayError::malformed_header(format!(
                    "shape {} exceeds the {} byte slice limit",
                    shape, MAX_SLICE_LEN
                )));
            }
        };
        if header.params.compress == CompressMethod::None && payload_len != slice_len {
            return Err(RelayError::malformed_header(format!(
                "uncompressed payload of {} bytes does not match {} ({} bytes)",
                payload_len, shape, slice_len
            )));
        }

        let payload = message.slice(HEADER_SIZE..HEADER_SIZE + payload_len);
        Ok(Self { header, payload })
    }

    /// Serialize header and payload into one message.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Reusable buffer a publisher encodes frames into.
///
/// The payload region starts right after the header so the codec can write
/// in place; [`FrameBuffer::finish`] then fills in the header and copies the
/// used prefix into one shared message.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Buffer able to hold a header plus `max_payload` bytes.
    pub fn with_payload_capacity(max_payload: usize) -> Self {
        Self { buf: vec![0u8; HEADER_SIZE + max_payload] }
    }

    pub fn payload_capacity(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Writable payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_SIZE..]
    }

    /// Write `header` and return the finished message.
    ///
    /// The payload length recorded in `header` selects how much of the
    /// payload region is sent.
    pub fn finish(&mut self, header: &FrameHeader) -> Result<Bytes> {
        let payload_len = header.payload_len as usize;
        if payload_len > self.payload_capacity() {
            return Err(RelayError::codec(format!(
                "payload of {} bytes exceeds the {} byte frame buffer",
                payload_len,
                self.payload_capacity()
            )));
        }
        header.encode_into(&mut self.buf);
        Ok(Bytes::copy_from_slice(&self.buf[..HEADER_SIZE + payload_len]))
    }
}
