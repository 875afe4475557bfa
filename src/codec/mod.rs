//! Frame codec abstraction.
//!
//! A codec turns one raw image slice into an encoded payload and back. Every
//! payload is produced by up to three stages, each selected by a method code
//! carried in the wire header:
//!
//! 1. **difference**: replace each pixel with its delta to the previous one
//! 2. **reorder**: regroup bytes so that similar bytes sit next to each other
//! 3. **compress**: general purpose compression of the reordered bytes
//!
//! The method codes are part of the wire format. `-1` always means "stage
//! disabled".

mod pixel;

pub use pixel::PixelCodec;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{ElementType, FrameShape};

/// Difference stage selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceMethod {
    #[default]
    None,
    /// Delta to the previous pixel in raster order.
    Pixel,
}

/// Reorder stage selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderMethod {
    #[default]
    None,
    /// Byte planes: all first bytes, then all second bytes, and so on.
    Bytepack,
}

/// Compress stage selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressMethod {
    #[default]
    None,
    Zstd,
}

/// Wire code of a disabled stage.
pub const METHOD_NONE: i16 = -1;

impl DifferenceMethod {
    pub const fn code(self) -> i16 {
        match self {
            DifferenceMethod::None => METHOD_NONE,
            DifferenceMethod::Pixel => 300,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            METHOD_NONE => Some(DifferenceMethod::None),
            300 => Some(DifferenceMethod::Pixel),
            _ => None,
        }
    }
}

impl ReorderMethod {
    pub const fn code(self) -> i16 {
        match self {
            ReorderMethod::None => METHOD_NONE,
            ReorderMethod::Bytepack => 100,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            METHOD_NONE => Some(ReorderMethod::None),
            100 => Some(ReorderMethod::Bytepack),
            _ => None,
        }
    }
}

impl CompressMethod {
    pub const fn code(self) -> i16 {
        match self {
            CompressMethod::None => METHOD_NONE,
            CompressMethod::Zstd => 200,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            METHOD_NONE => Some(CompressMethod::None),
            200 => Some(CompressMethod::Zstd),
            _ => None,
        }
    }
}

/// The three stage selectors used to encode one payload.
///
/// `CodecParams::default()` enables every stage. Use [`CodecParams::none`]
/// for raw pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecParams {
    pub difference: DifferenceMethod,
    pub reorder: ReorderMethod,
    pub compress: CompressMethod,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            difference: DifferenceMethod::Pixel,
            reorder: ReorderMethod::Bytepack,
            compress: CompressMethod::Zstd,
        }
    }
}

impl CodecParams {
    /// All stages disabled.
    pub const fn none() -> Self {
        Self {
            difference: DifferenceMethod::None,
            reorder: ReorderMethod::None,
            compress: CompressMethod::None,
        }
    }

    /// Whether every stage is disabled.
    pub fn is_passthrough(&self) -> bool {
        *self == Self::none()
    }

    /// The parameters actually applied to a stream of `element_type`.
    ///
    /// Only 16-bit integer images are compressed, every other type is sent
    /// raw.
    pub fn effective_for(&self, element_type: ElementType) -> Self {
        if element_type.is_16bit_integer() { *self } else { Self::none() }
    }
}

/// Encoder/decoder for one image slice.
///
/// A codec is configured for a single shape at a time. Reconfiguring with a
/// new shape or new parameters discards any internal buffers.
pub trait FrameCodec: Send {
    /// Prepare the codec for slices of `shape` using `params`.
    fn configure(&mut self, shape: FrameShape, params: CodecParams) -> Result<()>;

    /// The parameters the codec is configured with.
    fn params(&self) -> CodecParams;

    /// The shape the codec is configured for, if any.
    fn shape(&self) -> Option<FrameShape>;

    /// Upper bound on the encoded size of one slice.
    fn max_output_size(&self) -> usize;

    /// Encode `raw` into `out`, returning the number of bytes written.
    fn encode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Decode `encoded` into `out`, which must be exactly one slice long.
    fn decode(&mut self, encoded: &[u8], out: &mut [u8]) -> Result<()>;
}

/// Creates one codec per engine.
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn FrameCodec> + Send + Sync>;

/// Factory producing [`PixelCodec`]s.
pub fn pixel_codec_factory() -> CodecFactory {
    Arc::new(|| Box::new(PixelCodec::new()) as Box<dyn FrameCodec>)
}
