//! Decoder core boundary.
//!
//! Every codec format is driven through the [`Accelerator`] trait. A session
//! picks one implementation at construction time via [`open`] and owns it for
//! its whole lifetime.
//!
//! The implementations shipped here ([`h264`], [`hevc`], [`vp9`]) are software
//! models of a hardware decode core: they walk the bitstream far enough to
//! find sequence headers and picture boundaries, and reproduce the core's
//! buffer protocol and status codes without reconstructing any pixels.

pub mod bitstream;
pub mod h264;
pub mod hevc;
pub mod model;
pub mod synth;
pub mod vp9;

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::dma::DmaBufferRef;
use crate::error::AccelError;

pub use model::{FaultKind, ModelParams};

/// Number of parallel post-processing outputs (one raw plus four scaled).
pub const MAX_PP_OUTPUTS: usize = 5;
/// Largest picture edge, in luma samples, the core decodes or scales to.
pub const MAX_PICTURE_DIMENSION: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    H264,
    Hevc,
    Vp9,
}

impl CodecFormat {
    /// Extra external buffers requested beyond the core's own ask.
    pub fn default_buffer_margin(self) -> usize {
        match self {
            CodecFormat::H264 => 2,
            CodecFormat::Hevc => 2,
            CodecFormat::Vp9 => 1,
        }
    }

    /// Whether the format delivers pictures in Annex B byte-stream form.
    pub fn is_annex_b(self) -> bool {
        matches!(self, CodecFormat::H264 | CodecFormat::Hevc)
    }
}

impl fmt::Display for CodecFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecFormat::H264 => "h264",
            CodecFormat::Hevc => "hevc",
            CodecFormat::Vp9 => "vp9",
        };
        f.write_str(name)
    }
}

/// Status returned by [`Accelerator::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeStatus {
    Ok,
    BufferEmpty,
    StreamProcessed,
    NonRefSkipped,
    HeadersReady,
    AdvancedToolingDetected,
    PictureDecoded,
    WaitingForBuffer,
    NoDecodingBuffer,
    StreamNotSupported,
    HwTimeout,
    SystemError,
}

/// Outcome of one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutput {
    pub status: DecodeStatus,
    /// Bytes of the input the core is done with.
    pub consumed: usize,
}

impl DecodeOutput {
    pub fn new(status: DecodeStatus, consumed: usize) -> Self {
        Self { status, consumed }
    }
}

/// Bitstream handed to the core for one decode call.
#[derive(Debug, Clone, Copy)]
pub struct InputBuffer<'a> {
    pub data: &'a [u8],
    pub bus_address: u64,
    pub decode_order_id: u64,
}

/// Stream parameters known once the sequence headers are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceInfo {
    pub format: CodecFormat,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub profile: u32,
    /// Pictures the core needs to hold for reference.
    pub dpb_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Resolved configuration of one post-processing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PpUnit {
    pub enabled: bool,
    pub crop: CropRect,
    pub width: u32,
    pub height: u32,
    pub compressed: bool,
    pub bit_depth: u8,
}

impl PpUnit {
    /// Row pitch in bytes, saturating at `u32::MAX`.
    pub fn stride(&self) -> u32 {
        let bytes_per_sample = if self.bit_depth > 8 { 2 } else { 1 };
        let stride = (u64::from(self.width) * bytes_per_sample).next_multiple_of(16);
        u32::try_from(stride).unwrap_or(u32::MAX)
    }

    /// Bytes of one 4:2:0 picture written by this unit.
    pub fn picture_bytes(&self) -> usize {
        let luma = (self.stride() as usize).saturating_mul(self.height as usize);
        luma.saturating_add(luma / 2)
    }
}

/// Post-processing configuration pushed to the core after headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PpConfig {
    pub units: [PpUnit; MAX_PP_OUTPUTS],
}

impl PpConfig {
    pub fn enabled(&self) -> impl Iterator<Item = (usize, &PpUnit)> {
        self.units.iter().enumerate().filter(|(_, unit)| unit.enabled)
    }

    /// Size of one external picture buffer holding every enabled output.
    pub fn picture_bytes(&self) -> usize {
        self.enabled()
            .fold(0usize, |total, (_, unit)| total.saturating_add(unit.picture_bytes()))
    }
}

/// One post-processing output of a decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PictureOutput {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub compressed: bool,
    pub bit_depth: u8,
    pub crop: CropRect,
    pub bus_address: u64,
}

/// A finished picture. Exactly one party owns it at a time; it ends its life
/// by being handed back through [`Accelerator::picture_consumed`].
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedPicture {
    pub pic_id: u32,
    pub decode_order_id: u64,
    pub keyframe: bool,
    pub outputs: [Option<PictureOutput>; MAX_PP_OUTPUTS],
}

#[derive(Debug)]
pub enum NextPicture {
    Ready(DecodedPicture),
    NotReady,
    EndOfStream,
}

/// Answer of [`Accelerator::get_buffer_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// A buffer the core no longer needs, if any.
    pub buffer_to_free: Option<DmaBufferRef>,
    /// Size of the buffers the core is asking for.
    pub requested_size: usize,
    /// How many more buffers the core is asking for.
    pub buffer_count: usize,
}

/// Parameters for [`open`].
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub model: ModelParams,
}

/// A per-format decode core.
pub trait Accelerator: Send {
    fn format(&self) -> CodecFormat;
    fn get_info(&self) -> Result<SequenceInfo, AccelError>;
    fn set_info(&mut self, pp: &PpConfig, info: &SequenceInfo) -> Result<(), AccelError>;
    fn decode(&mut self, input: &InputBuffer<'_>) -> Result<DecodeOutput, AccelError>;
    fn next_picture(&mut self) -> Result<NextPicture, AccelError>;
    fn picture_consumed(&mut self, picture: DecodedPicture) -> Result<(), AccelError>;
    fn end_of_stream(&mut self) -> Result<(), AccelError>;
    fn get_buffer_info(&mut self) -> BufferInfo;
    fn add_buffer(&mut self, buffer: DmaBufferRef) -> Result<DecodeStatus, AccelError>;
    fn release(&mut self);
}

/// Initialise the decode core for `format`.
pub fn open(format: CodecFormat, config: &CoreConfig) -> Result<Box<dyn Accelerator>, AccelError> {
    let core: Box<dyn Accelerator> = match format {
        CodecFormat::H264 => Box::new(h264::H264Core::init(config)?),
        CodecFormat::Hevc => Box::new(hevc::HevcCore::init(config)?),
        CodecFormat::Vp9 => Box::new(vp9::Vp9Core::init(config)?),
    };
    Ok(core)
}
