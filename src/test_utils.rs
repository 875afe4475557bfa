//! Test utilities shared by unit tests, integration tests and benches.
//!
//! Provides synthetic frames, a codec wrapper that counts its invocations and
//! a reporter that records every event it receives.

#![cfg(any(test, feature = "benchmark"))]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::Result;
use crate::codec::{CodecFactory, CodecParams, FrameCodec, PixelCodec};
use crate::reporter::{Reporter, StreamEvent};
use crate::types::{ElementType, FrameShape, StreamDescriptor, Timestamp};
use crate::wire::{FrameBuffer, FrameHeader};

/// A 32x32 `u8` image.
pub fn small_u8_shape() -> FrameShape {
    FrameShape::new(32, 32, ElementType::UInt8)
}

/// A 64x48 `u16` image, the shape compression applies to.
pub fn u16_shape() -> FrameShape {
    FrameShape::new(64, 48, ElementType::UInt16)
}

/// Deterministic slice for `shape`, varying with `seed`.
///
/// 16-bit images get a smooth gradient with a little noise, like a camera
/// frame; everything else gets a byte ramp.
pub fn ramp_frame(shape: FrameShape, seed: u64) -> Vec<u8> {
    let len = shape.slice_len();
    if shape.element_type.size() == 2 {
        let mut out = Vec::with_capacity(len);
        let width = shape.width.max(1) as u64;
        for i in 0..shape.pixels() as u64 {
            let (x, y) = (i % width, i / width);
            let noise = (i.wrapping_mul(2654435761).wrapping_add(seed) >> 7) % 5;
            let value = (1000 + x * 3 + y * 2 + seed * 11 + noise) as u16;
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    } else {
        (0..len).map(|i| (i as u64).wrapping_add(seed) as u8).collect()
    }
}

/// Encode `raw` into a complete wire message the way a publisher would.
///
/// The timestamp is derived from `frame_counter`.
pub fn encode_frame(
    name: &str,
    shape: FrameShape,
    frame_counter: u64,
    params: CodecParams,
    raw: &[u8],
) -> Result<Bytes> {
    let mut codec = PixelCodec::new();
    codec.configure(shape, params)?;
    let mut frame = FrameBuffer::with_payload_capacity(codec.max_output_size());
    let payload_len = codec.encode(raw, frame.payload_mut())?;
    let header = FrameHeader::new(
        StreamDescriptor {
            name: name.to_string(),
            width: shape.width,
            height: shape.height,
            element_type: shape.element_type,
            frame_counter,
            timestamp: Timestamp::new(frame_counter, 500),
        },
        params,
        payload_len as u32,
    );
    frame.finish(&header)
}

/// Codec wrapper counting encode and decode calls.
pub struct CountingCodec {
    inner: PixelCodec,
    encodes: Arc<AtomicUsize>,
    decodes: Arc<AtomicUsize>,
}

/// Shared counters of every codec built by a [`counting_codecs`] factory.
#[derive(Debug, Clone, Default)]
pub struct CodecCounters {
    pub encodes: Arc<AtomicUsize>,
    pub decodes: Arc<AtomicUsize>,
}

impl CodecCounters {
    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

/// Factory of [`CountingCodec`]s that all report into the returned counters.
pub fn counting_codecs() -> (CodecFactory, CodecCounters) {
    let counters = CodecCounters::default();
    let shared = counters.clone();
    let factory: CodecFactory = Arc::new(move || {
        Box::new(CountingCodec {
            inner: PixelCodec::new(),
            encodes: Arc::clone(&shared.encodes),
            decodes: Arc::clone(&shared.decodes),
        }) as Box<dyn FrameCodec>
    });
    (factory, counters)
}

impl FrameCodec for CountingCodec {
    fn configure(&mut self, shape: FrameShape, params: CodecParams) -> Result<()> {
        self.inner.configure(shape, params)
    }

    fn params(&self) -> CodecParams {
        self.inner.params()
    }

    fn shape(&self) -> Option<FrameShape> {
        self.inner.shape()
    }

    fn max_output_size(&self) -> usize {
        self.inner.max_output_size()
    }

    fn encode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(raw, out)
    }

    fn decode(&mut self, encoded: &[u8], out: &mut [u8]) -> Result<()> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(encoded, out)
    }
}

/// Reporter keeping every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&StreamEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: StreamEvent) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event);
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Run `future` with a timeout, panicking with `what` if it does not finish.
pub async fn within<T>(timeout: Duration, what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_frames_fill_one_slice() {
        assert_eq!(ramp_frame(small_u8_shape(), 0).len(), 32 * 32);
        assert_eq!(ramp_frame(u16_shape(), 3).len(), 64 * 48 * 2);
        assert_ne!(ramp_frame(u16_shape(), 1), ramp_frame(u16_shape(), 2));
    }

    #[test]
    fn encoded_frames_parse() {
        let shape = u16_shape();
        let raw = ramp_frame(shape, 9);
        let message = encode_frame("cam0", shape, 9, CodecParams::default(), &raw).unwrap();
        let frame = crate::wire::WireFrame::parse(message).unwrap();
        assert_eq!(frame.header.descriptor.name, "cam0");
        assert_eq!(frame.header.descriptor.shape(), shape);
        assert!(frame.payload.len() < raw.len());
    }

    #[test]
    fn counting_codec_counts() {
        let (factory, counters) = counting_codecs();
        let mut codec = factory();
        let shape = small_u8_shape();
        codec.configure(shape, CodecParams::none()).unwrap();

        let raw = ramp_frame(shape, 0);
        let mut encoded = vec![0u8; codec.max_output_size()];
        let len = codec.encode(&raw, &mut encoded).unwrap();
        let mut decoded = vec![0u8; shape.slice_len()];
        codec.decode(&encoded[..len], &mut decoded).unwrap();

        assert_eq!(decoded, raw);
        assert_eq!(counters.encodes(), 1);
        assert_eq!(counters.decodes(), 1);
    }
}
