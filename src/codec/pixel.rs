//! Pixel codec with difference, byte-plane reorder and zstd stages

use tracing::trace;

use super::{CodecParams, CompressMethod, DifferenceMethod, FrameCodec, ReorderMethod};
use crate::types::FrameShape;
use crate::{RelayError, Result};

/// zstd level used for the compress stage. Favours speed over ratio.
const ZSTD_LEVEL: i32 = 1;

/// Default [`FrameCodec`] implementation.
///
/// The difference stage works on 16-bit words and is rejected for any other
/// element size. Reorder and compress accept every element type.
#[derive(Debug, Default)]
pub struct PixelCodec {
    shape: Option<FrameShape>,
    params: CodecParams,
    differenced: Vec<u8>,
    reordered: Vec<u8>,
    decompressed: Vec<u8>,
}

impl PixelCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn configured_shape(&self) -> Result<FrameShape> {
        self.shape.ok_or_else(|| RelayError::codec("codec used before configure"))
    }
}

impl FrameCodec for PixelCodec {
    fn configure(&mut self, shape: FrameShape, params: CodecParams) -> Result<()> {
        if params.difference == DifferenceMethod::Pixel && shape.element_type.size() != 2 {
            return Err(RelayError::codec(format!(
                "pixel differencing needs 16-bit elements, got {}",
                shape.element_type
            )));
        }

        trace!(%shape, ?params, "Configuring pixel codec");
        self.shape = Some(FrameShape::new(shape.width, shape.height, shape.element_type));
        self.params = params;
        self.differenced.clear();
        self.reordered.clear();
        self.decompressed.clear();
        Ok(())
    }

    fn params(&self) -> CodecParams {
        self.params
    }

    fn shape(&self) -> Option<FrameShape> {
        self.shape
    }

    fn max_output_size(&self) -> usize {
        let raw = self.shape.map(|s| s.slice_len()).unwrap_or(0);
        match self.params.compress {
            CompressMethod::None => raw,
            CompressMethod::Zstd => zstd::zstd_safe::compress_bound(raw),
        }
    }

    fn encode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize> {
        let shape = self.configured_shape()?;
        if raw.len() != shape.slice_len() {
            return Err(RelayError::codec(format!(
                "raw slice is {} bytes, expected {} for {}",
                raw.len(),
                shape.slice_len(),
                shape
            )));
        }

        let mut current: &[u8] = raw;
        if self.params.difference == DifferenceMethod::Pixel {
            difference_words(current, &mut self.differenced);
            current = &self.differenced;
        }
        if self.params.reorder == ReorderMethod::Bytepack {
            bytepack(current, shape.element_type.size(), &mut self.reordered);
            current = &self.reordered;
        }

        match self.params.compress {
            CompressMethod::None => {
                if out.len() < current.len() {
                    return Err(RelayError::codec(format!(
                        "output buffer of {} bytes cannot hold {} bytes",
                        out.len(),
                        current.len()
                    )));
                }
                out[..current.len()].copy_from_slice(current);
                Ok(current.len())
            }
            CompressMethod::Zstd => zstd::bulk::compress_to_buffer(current, out, ZSTD_LEVEL)
                .map_err(|e| RelayError::codec_with_source("zstd compression failed", Box::new(e))),
        }
    }

    fn decode(&mut self, encoded: &[u8], out: &mut [u8]) -> Result<()> {
        let shape = self.configured_shape()?;
        let expected = shape.slice_len();
        if out.len() != expected {
            return Err(RelayError::codec(format!(
                "decode target is {} bytes, expected {}",
                out.len(),
                expected
            )));
        }

        let decompressed: &[u8] = match self.params.compress {
            CompressMethod::None => {
                if encoded.len() != expected {
                    return Err(RelayError::codec(format!(
                        "payload is {} bytes, expected {} for {}",
                        encoded.len(),
                        expected,
                        shape
                    )));
                }
                encoded
            }
            CompressMethod::Zstd => {
                self.decompressed.resize(expected, 0);
                let written =
                    zstd::bulk::decompress_to_buffer(encoded, &mut self.decompressed[..]).map_err(
                        |e| RelayError::codec_with_source("zstd decompression failed", Box::new(e)),
                    )?;
                if written != expected {
                    return Err(RelayError::codec(format!(
                        "payload decompressed to {} bytes, expected {}",
                        written, expected
                    )));
                }
                &self.decompressed
            }
        };

        match self.params.reorder {
            ReorderMethod::Bytepack => unbytepack(decompressed, shape.element_type.size(), out),
            ReorderMethod::None => out.copy_from_slice(decompressed),
        }

        if self.params.difference == DifferenceMethod::Pixel {
            undifference_words(out);
        }
        Ok(())
    }
}

/// Replace each little-endian 16-bit word with its wrapping delta to the
/// previous word. The first word is kept as is.
fn difference_words(src: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(src.len());
    let mut previous = 0u16;
    for pair in src.chunks_exact(2) {
        let value = u16::from_le_bytes([pair[0], pair[1]]);
        dst.extend_from_slice(&value.wrapping_sub(previous).to_le_bytes());
        previous = value;
    }
}

fn undifference_words(buf: &mut [u8]) {
    let mut previous = 0u16;
    for pair in buf.chunks_exact_mut(2) {
        let value = u16::from_le_bytes([pair[0], pair[1]]).wrapping_add(previous);
        pair.copy_from_slice(&value.to_le_bytes());
        previous = value;
    }
}

/// Split elements into byte planes.
fn bytepack(src: &[u8], element_size: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.resize(src.len(), 0);
    let count = src.len() / element_size;
    for (i, element) in src.chunks_exact(element_size).enumerate() {
        for (plane, byte) in element.iter().enumerate() {
            dst[plane * count + i] = *byte;
        }
    }
}

fn unbytepack(src: &[u8], element_size: usize, dst: &mut [u8]) {
    let count = src.len() / element_size;
    for (i, element) in dst.chunks_exact_mut(element_size).enumerate() {
        for (plane, byte) in element.iter_mut().enumerate() {
            *byte = src[plane * count + i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;
    use proptest::prelude::*;

    fn configured(shape: FrameShape, params: CodecParams) -> PixelCodec {
        let mut codec = PixelCodec::new();
        codec.configure(shape, params).unwrap();
        codec
    }

    fn ramp_u16(shape: FrameShape) -> Vec<u8> {
        (0..shape.pixels()).flat_map(|i| ((i * 3 + 1000) as u16).to_le_bytes()).collect()
    }

    proptest! {
        #[test]
        fn prop_full_pipeline_restores_pixels(
            pixels in prop::collection::vec(any::<u16>(), 1..512),
            difference in prop::bool::ANY,
            reorder in prop::bool::ANY,
            compress in prop::bool::ANY,
        ) {
            let shape = FrameShape::new(pixels.len() as u32, 1, ElementType::Int16);
            let params = CodecParams {
                difference: if difference { DifferenceMethod::Pixel } else { DifferenceMethod::None },
                reorder: if reorder { ReorderMethod::Bytepack } else { ReorderMethod::None },
                compress: if compress { CompressMethod::Zstd } else { CompressMethod::None },
            };
            let raw: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();

            let mut encoder = configured(shape, params);
            let mut encoded = vec![0u8; encoder.max_output_size()];
            let len = encoder.encode(&raw, &mut encoded).unwrap();

            let mut decoder = configured(shape, params);
            let mut decoded = vec![0u8; shape.slice_len()];
            decoder.decode(&encoded[..len], &mut decoded).unwrap();
            prop_assert_eq!(decoded, raw);
        }
    }

    #[test]
    fn smooth_images_compress() {
        let shape = FrameShape::new(64, 64, ElementType::UInt16);
        let mut codec = configured(shape, CodecParams::default());
        let raw = ramp_u16(shape);
        let mut encoded = vec![0u8; codec.max_output_size()];
        let len = codec.encode(&raw, &mut encoded).unwrap();
        assert!(len < raw.len() / 4, "encoded {} of {} bytes", len, raw.len());
    }

    #[test]
    fn passthrough_copies_bytes() {
        let shape = FrameShape::new(4, 2, ElementType::Float32);
        let mut codec = configured(shape, CodecParams::none());
        let raw: Vec<u8> = (0..shape.slice_len() as u8).collect();
        assert_eq!(codec.max_output_size(), raw.len());

        let mut encoded = vec![0u8; codec.max_output_size()];
        let len = codec.encode(&raw, &mut encoded).unwrap();
        assert_eq!(&encoded[..len], raw.as_slice());
    }

    #[test]
    fn bytepack_groups_byte_planes() {
        let mut packed = Vec::new();
        bytepack(&[1, 2, 3, 4, 5, 6], 2, &mut packed);
        assert_eq!(packed, vec![1, 3, 5, 2, 4, 6]);

        let mut restored = [0u8; 6];
        unbytepack(&packed, 2, &mut restored);
        assert_eq!(restored, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn differencing_wraps() {
        let raw: Vec<u8> = [10u16, 5, 65535, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut deltas = Vec::new();
        difference_words(&raw, &mut deltas);
        let words: Vec<u16> =
            deltas.chunks_exact(2).map(|p| u16::from_le_bytes([p[0], p[1]])).collect();
        assert_eq!(words, vec![10, 65531, 65530, 1]);

        undifference_words(&mut deltas);
        assert_eq!(deltas, raw);
    }

    #[test]
    fn differencing_rejects_wide_elements() {
        let mut codec = PixelCodec::new();
        let err = codec
            .configure(FrameShape::new(8, 8, ElementType::Float32), CodecParams::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::Codec { .. }));
    }

    #[test]
    fn wrong_sizes_are_codec_errors() {
        let shape = FrameShape::new(8, 8, ElementType::UInt16);
        let mut codec = configured(shape, CodecParams::default());
        let mut out = vec![0u8; codec.max_output_size()];
        assert!(codec.encode(&[0u8; 10], &mut out).is_err());

        let mut decoded = vec![0u8; shape.slice_len()];
        assert!(codec.decode(b"definitely not zstd", &mut decoded).is_err());
        assert!(codec.decode(&[], &mut decoded[..4]).is_err());
    }

    #[test]
    fn unconfigured_codec_refuses_work() {
        let mut codec = PixelCodec::new();
        let mut out = [0u8; 4];
        assert!(codec.encode(&[0u8; 4], &mut out).is_err());
        assert!(codec.shape().is_none());
    }

    #[test]
    fn configure_flattens_cubes() {
        let codec = configured(FrameShape::cube(16, 16, 10, ElementType::UInt16), CodecParams::none());
        assert_eq!(codec.shape(), Some(FrameShape::new(16, 16, ElementType::UInt16)));
        assert_eq!(codec.max_output_size(), 16 * 16 * 2);
    }
}
