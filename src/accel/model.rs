//! Software model of a hardware decode core.
//!
//! `ModelCore` reproduces the core's externally visible protocol: header
//! detection, the post-processing handshake, the external buffer request and
//! release cycle, display reordering, picture ownership and end of stream.
//! Everything format specific is delegated to a [`FormatSyntax`], which only
//! has to locate sequence headers and picture units in the bitstream.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    Accelerator, BufferInfo, CodecFormat, CoreConfig, DecodeOutput, DecodeStatus, DecodedPicture,
    InputBuffer, MAX_PICTURE_DIMENSION, MAX_PP_OUTPUTS, NextPicture, PictureOutput, PpConfig,
    SequenceInfo,
};
use crate::dma::DmaBufferRef;
use crate::error::AccelError;

/// Tunables of the software decode core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Picture size used when a sequence header cannot be parsed.
    pub fallback_width: u32,
    pub fallback_height: u32,
    /// Reference pictures the core asks external buffers for.
    pub dpb_size: usize,
    /// Report `fault` once this many pictures were decoded.
    pub fault_after_pictures: Option<u64>,
    pub fault: FaultKind,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            fallback_width: 640,
            fallback_height: 360,
            dpb_size: 4,
            fault_after_pictures: None,
            fault: FaultKind::HwTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    #[default]
    HwTimeout,
    SystemError,
}

/// How the core treats a stream's profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSupport {
    Supported,
    /// Decodable, but uses legacy error-resilience tools (ASO/FMO and friends).
    AdvancedTooling,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeaders {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub profile: u32,
    pub support: ProfileSupport,
}

/// The unit found at the head of the remaining bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxUnit {
    Sequence { headers: StreamHeaders, len: usize },
    Picture { reference: bool, keyframe: bool, len: usize },
    Skip { len: usize },
}

/// Format specific bitstream walking.
pub trait FormatSyntax: Send + Default + 'static {
    const FORMAT: CodecFormat;
    /// Whether reference pictures are held back for display reordering.
    const REORDERS: bool;

    /// Classifies the unit at the start of `data`. Must report a non-zero
    /// length for non-empty input, except for a sequence unit whose headers
    /// live inside the picture that follows.
    fn next_unit(&mut self, data: &[u8], params: &ModelParams) -> SyntaxUnit;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NoSequence,
    AwaitingInfo,
    Active,
    Released,
}

#[derive(Debug)]
struct ModelBuffer {
    buffer: DmaBufferRef,
    holder: Option<u32>,
    retiring: bool,
}

pub struct ModelCore<S: FormatSyntax> {
    syntax: S,
    params: ModelParams,
    phase: Phase,
    pending_headers: Option<StreamHeaders>,
    current_headers: Option<StreamHeaders>,
    sequence: Option<SequenceInfo>,
    tooling_acknowledged: bool,
    pp: PpConfig,
    picture_bytes: usize,
    buffers: Vec<ModelBuffer>,
    to_free: VecDeque<DmaBufferRef>,
    held: Option<DecodedPicture>,
    ready: VecDeque<DecodedPicture>,
    next_pic_id: u32,
    pictures_decoded: u64,
    end_of_stream: bool,
}

impl<S: FormatSyntax> std::fmt::Debug for ModelCore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCore")
            .field("format", &S::FORMAT)
            .field("phase", &self.phase)
            .field("buffers", &self.buffers.len())
            .field("ready", &self.ready.len())
            .field("pictures_decoded", &self.pictures_decoded)
            .finish()
    }
}

impl<S: FormatSyntax> ModelCore<S> {
    pub fn init(config: &CoreConfig) -> Result<Self, AccelError> {
        if config.model.dpb_size == 0 {
            return Err(AccelError::InvalidParam("dpb_size must be > 0".into()));
        }
        if config.model.fallback_width == 0 || config.model.fallback_height == 0 {
            return Err(AccelError::InvalidParam(
                "fallback picture size must be non-zero".into(),
            ));
        }
        debug!(format = %S::FORMAT, dpb_size = config.model.dpb_size, "decoder core initialised");
        Ok(Self {
            syntax: S::default(),
            params: config.model.clone(),
            phase: Phase::NoSequence,
            pending_headers: None,
            current_headers: None,
            sequence: None,
            tooling_acknowledged: false,
            pp: PpConfig::default(),
            picture_bytes: 0,
            buffers: Vec::new(),
            to_free: VecDeque::new(),
            held: None,
            ready: VecDeque::new(),
            next_pic_id: 0,
            pictures_decoded: 0,
            end_of_stream: false,
        })
    }

    fn buffer_shortfall(&self) -> usize {
        if self.phase != Phase::Active {
            return 0;
        }
        let required = self.sequence.map(|s| s.dpb_size).unwrap_or(0);
        let usable = self.buffers.iter().filter(|b| !b.retiring).count();
        required.saturating_sub(usable)
    }

    fn fault_due(&self) -> Option<DecodeStatus> {
        let limit = self.params.fault_after_pictures?;
        (self.pictures_decoded >= limit).then_some(match self.params.fault {
            FaultKind::HwTimeout => DecodeStatus::HwTimeout,
            FaultKind::SystemError => DecodeStatus::SystemError,
        })
    }

    fn on_headers(&mut self, headers: StreamHeaders, len: usize) -> DecodeOutput {
        match headers.support {
            ProfileSupport::Unsupported => {
                return DecodeOutput::new(DecodeStatus::StreamNotSupported, len);
            }
            ProfileSupport::AdvancedTooling if !self.tooling_acknowledged => {
                self.tooling_acknowledged = true;
                return DecodeOutput::new(DecodeStatus::AdvancedToolingDetected, 0);
            }
            _ => {}
        }
        if headers.width > MAX_PICTURE_DIMENSION || headers.height > MAX_PICTURE_DIMENSION {
            warn!(
                width = headers.width,
                height = headers.height,
                "picture size beyond the core's limit"
            );
            return DecodeOutput::new(DecodeStatus::StreamNotSupported, len);
        }
        if self.current_headers == Some(headers) {
            return DecodeOutput::new(DecodeStatus::StreamProcessed, len);
        }
        debug!(
            width = headers.width,
            height = headers.height,
            bit_depth = headers.bit_depth,
            "sequence headers decoded"
        );
        self.pending_headers = Some(headers);
        self.phase = Phase::AwaitingInfo;
        DecodeOutput::new(DecodeStatus::HeadersReady, len)
    }

    fn on_picture(
        &mut self,
        reference: bool,
        keyframe: bool,
        len: usize,
        decode_order_id: u64,
    ) -> DecodeOutput {
        if self.phase != Phase::Active {
            trace!("picture before sequence headers dropped");
            return DecodeOutput::new(DecodeStatus::StreamProcessed, len);
        }
        let Some(index) = self
            .buffers
            .iter()
            .position(|b| b.holder.is_none() && !b.retiring)
        else {
            if let Some(held) = self.held.take() {
                self.ready.push_back(held);
            }
            return DecodeOutput::new(DecodeStatus::NoDecodingBuffer, 0);
        };

        let pic_id = self.next_pic_id;
        self.next_pic_id = self.next_pic_id.wrapping_add(1);
        self.buffers[index].holder = Some(pic_id);
        let picture = DecodedPicture {
            pic_id,
            decode_order_id,
            keyframe,
            outputs: self.picture_outputs(self.buffers[index].buffer.bus_address),
        };
        self.pictures_decoded += 1;

        if S::REORDERS && reference {
            if let Some(previous) = self.held.replace(picture) {
                self.ready.push_back(previous);
            }
        } else {
            self.ready.push_back(picture);
        }
        DecodeOutput::new(DecodeStatus::PictureDecoded, len)
    }

    fn picture_outputs(&self, base: u64) -> [Option<PictureOutput>; MAX_PP_OUTPUTS] {
        let mut outputs = [None; MAX_PP_OUTPUTS];
        let mut offset = 0u64;
        for (index, unit) in self.pp.enabled() {
            outputs[index] = Some(PictureOutput {
                width: unit.width,
                height: unit.height,
                stride: unit.stride(),
                compressed: unit.compressed,
                bit_depth: unit.bit_depth,
                crop: unit.crop,
                bus_address: base + offset,
            });
            offset += unit.picture_bytes() as u64;
        }
        outputs
    }

    fn retire_buffers(&mut self) {
        if let Some(held) = self.held.take() {
            self.ready.push_back(held);
        }
        for buffer in &mut self.buffers {
            buffer.retiring = true;
        }
        self.collect_retired();
    }

    fn collect_retired(&mut self) {
        let mut kept = Vec::with_capacity(self.buffers.len());
        for buffer in self.buffers.drain(..) {
            if buffer.retiring && buffer.holder.is_none() {
                self.to_free.push_back(buffer.buffer);
            } else {
                kept.push(buffer);
            }
        }
        self.buffers = kept;
    }
}

impl<S: FormatSyntax> Accelerator for ModelCore<S> {
    fn format(&self) -> CodecFormat {
        S::FORMAT
    }

    fn get_info(&self) -> Result<SequenceInfo, AccelError> {
        if self.phase == Phase::Released {
            return Err(AccelError::Released);
        }
        let headers = self
            .pending_headers
            .or(self.current_headers)
            .ok_or(AccelError::NoSequence)?;
        Ok(SequenceInfo {
            format: S::FORMAT,
            width: headers.width,
            height: headers.height,
            bit_depth: headers.bit_depth,
            profile: headers.profile,
            dpb_size: self.params.dpb_size,
        })
    }

    fn set_info(&mut self, pp: &PpConfig, info: &SequenceInfo) -> Result<(), AccelError> {
        match self.phase {
            Phase::Released => return Err(AccelError::Released),
            Phase::NoSequence => return Err(AccelError::NoSequence),
            Phase::AwaitingInfo | Phase::Active => {}
        }
        if pp.enabled().next().is_none() {
            return Err(AccelError::InvalidParam(
                "at least one post-processing output must be enabled".into(),
            ));
        }
        if let Some((index, _)) = pp.enabled().find(|(_, u)| u.width == 0 || u.height == 0) {
            return Err(AccelError::InvalidParam(format!(
                "post-processing output {index} has an empty size"
            )));
        }
        if info.dpb_size == 0 {
            return Err(AccelError::InvalidParam("dpb_size must be > 0".into()));
        }

        let picture_bytes = pp.picture_bytes();
        if picture_bytes != self.picture_bytes && !self.buffers.is_empty() {
            debug!(
                old = self.picture_bytes,
                new = picture_bytes,
                "picture size changed, retiring external buffers"
            );
            self.retire_buffers();
        }
        if let Some(headers) = self.pending_headers.take() {
            self.current_headers = Some(headers);
        }
        self.pp = *pp;
        self.picture_bytes = picture_bytes;
        self.sequence = Some(*info);
        self.phase = Phase::Active;
        Ok(())
    }

    fn decode(&mut self, input: &InputBuffer<'_>) -> Result<DecodeOutput, AccelError> {
        match self.phase {
            Phase::Released => return Err(AccelError::Released),
            Phase::AwaitingInfo => {
                return Err(AccelError::InvalidParam(
                    "set_info must follow headers".into(),
                ));
            }
            Phase::NoSequence | Phase::Active => {}
        }
        if input.data.is_empty() {
            return Ok(DecodeOutput::new(DecodeStatus::BufferEmpty, 0));
        }
        if self.end_of_stream {
            return Ok(DecodeOutput::new(
                DecodeStatus::StreamProcessed,
                input.data.len(),
            ));
        }
        if let Some(fault) = self.fault_due() {
            return Ok(DecodeOutput::new(fault, 0));
        }
        if self.buffer_shortfall() > 0 {
            return Ok(DecodeOutput::new(DecodeStatus::WaitingForBuffer, 0));
        }

        let output = match self.syntax.next_unit(input.data, &self.params) {
            SyntaxUnit::Skip { len } => DecodeOutput::new(DecodeStatus::Ok, len),
            SyntaxUnit::Sequence { headers, len } => self.on_headers(headers, len),
            SyntaxUnit::Picture {
                reference,
                keyframe,
                len,
            } => self.on_picture(reference, keyframe, len, input.decode_order_id),
        };
        Ok(DecodeOutput::new(
            output.status,
            output.consumed.min(input.data.len()),
        ))
    }

    fn next_picture(&mut self) -> Result<NextPicture, AccelError> {
        if self.phase == Phase::Released {
            return Err(AccelError::Released);
        }
        if let Some(picture) = self.ready.pop_front() {
            return Ok(NextPicture::Ready(picture));
        }
        if self.end_of_stream && self.held.is_none() {
            return Ok(NextPicture::EndOfStream);
        }
        Ok(NextPicture::NotReady)
    }

    fn picture_consumed(&mut self, picture: DecodedPicture) -> Result<(), AccelError> {
        if self.phase == Phase::Released {
            return Err(AccelError::Released);
        }
        let buffer = self
            .buffers
            .iter_mut()
            .find(|b| b.holder == Some(picture.pic_id))
            .ok_or(AccelError::UnknownPicture(picture.pic_id))?;
        buffer.holder = None;
        if buffer.retiring {
            self.collect_retired();
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<(), AccelError> {
        if self.phase == Phase::Released {
            return Err(AccelError::Released);
        }
        self.end_of_stream = true;
        if let Some(held) = self.held.take() {
            self.ready.push_back(held);
        }
        Ok(())
    }

    fn get_buffer_info(&mut self) -> BufferInfo {
        let shortfall = self.buffer_shortfall();
        BufferInfo {
            buffer_to_free: self.to_free.pop_front(),
            requested_size: if shortfall > 0 { self.picture_bytes } else { 0 },
            buffer_count: shortfall,
        }
    }

    fn add_buffer(&mut self, buffer: DmaBufferRef) -> Result<DecodeStatus, AccelError> {
        match self.phase {
            Phase::Released => return Err(AccelError::Released),
            Phase::Active => {}
            Phase::NoSequence | Phase::AwaitingInfo => return Err(AccelError::NoSequence),
        }
        if buffer.size < self.picture_bytes {
            return Err(AccelError::InvalidParam(format!(
                "buffer of {} bytes is smaller than the {} byte picture",
                buffer.size, self.picture_bytes
            )));
        }
        if self
            .buffers
            .iter()
            .any(|b| b.buffer.bus_address == buffer.bus_address)
        {
            return Err(AccelError::InvalidParam(format!(
                "buffer {:#x} added twice",
                buffer.bus_address
            )));
        }
        self.buffers.push(ModelBuffer {
            buffer,
            holder: None,
            retiring: false,
        });
        Ok(if self.buffer_shortfall() > 0 {
            DecodeStatus::WaitingForBuffer
        } else {
            DecodeStatus::Ok
        })
    }

    fn release(&mut self) {
        debug!(
            format = %S::FORMAT,
            pictures = self.pictures_decoded,
            "decoder core released"
        );
        self.phase = Phase::Released;
        self.buffers.clear();
        self.to_free.clear();
        self.ready.clear();
        self.held = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::PpUnit;

    /// One byte per unit: `S` sequence (64x64), `T` sequence (128x64),
    /// `W` sequence wider than the core supports, `X` unsupported,
    /// `A` advanced tooling, `P` reference picture,
    /// `b` non-reference picture, anything else is skipped.
    #[derive(Default)]
    struct ScriptSyntax;

    fn headers(width: u32, support: ProfileSupport) -> StreamHeaders {
        StreamHeaders {
            width,
            height: 64,
            bit_depth: 8,
            profile: 1,
            support,
        }
    }

    impl FormatSyntax for ScriptSyntax {
        const FORMAT: CodecFormat = CodecFormat::H264;
        const REORDERS: bool = true;

        fn next_unit(&mut self, data: &[u8], _params: &ModelParams) -> SyntaxUnit {
            match data[0] {
                b'S' => SyntaxUnit::Sequence {
                    headers: headers(64, ProfileSupport::Supported),
                    len: 1,
                },
                b'T' => SyntaxUnit::Sequence {
                    headers: headers(128, ProfileSupport::Supported),
                    len: 1,
                },
                b'W' => SyntaxUnit::Sequence {
                    headers: headers(MAX_PICTURE_DIMENSION + 16, ProfileSupport::Supported),
                    len: 1,
                },
                b'X' => SyntaxUnit::Sequence {
                    headers: headers(64, ProfileSupport::Unsupported),
                    len: 1,
                },
                b'A' => SyntaxUnit::Sequence {
                    headers: headers(64, ProfileSupport::AdvancedTooling),
                    len: 1,
                },
                b'P' => SyntaxUnit::Picture {
                    reference: true,
                    keyframe: false,
                    len: 1,
                },
                b'b' => SyntaxUnit::Picture {
                    reference: false,
                    keyframe: false,
                    len: 1,
                },
                _ => SyntaxUnit::Skip { len: 1 },
            }
        }
    }

    type ScriptCore = ModelCore<ScriptSyntax>;

    fn core(dpb_size: usize) -> ScriptCore {
        let config = CoreConfig {
            model: ModelParams {
                dpb_size,
                ..Default::default()
            },
        };
        ScriptCore::init(&config).unwrap()
    }

    fn decode(core: &mut ScriptCore, data: &[u8], id: u64) -> DecodeOutput {
        core.decode(&InputBuffer {
            data,
            bus_address: 0,
            decode_order_id: id,
        })
        .unwrap()
    }

    fn pp_for(info: &SequenceInfo) -> PpConfig {
        let mut pp = PpConfig::default();
        pp.units[0] = PpUnit {
            enabled: true,
            crop: Default::default(),
            width: info.width,
            height: info.height,
            compressed: false,
            bit_depth: info.bit_depth,
        };
        pp
    }

    /// Brings a core through headers and buffer allocation.
    fn activate(core: &mut ScriptCore, next_bus: &mut u64) {
        assert_eq!(decode(core, b"S", 0).status, DecodeStatus::HeadersReady);
        let info = core.get_info().unwrap();
        core.set_info(&pp_for(&info), &info).unwrap();
        supply(core, next_bus);
    }

    fn supply(core: &mut ScriptCore, next_bus: &mut u64) {
        let info = core.get_buffer_info();
        for _ in 0..info.buffer_count {
            core.add_buffer(DmaBufferRef {
                bus_address: *next_bus,
                size: info.requested_size,
            })
            .unwrap();
            *next_bus += 0x10_0000;
        }
    }

    fn drain(core: &mut ScriptCore) -> Vec<DecodedPicture> {
        let mut out = Vec::new();
        while let NextPicture::Ready(picture) = core.next_picture().unwrap() {
            out.push(picture);
        }
        out
    }

    #[test]
    fn requests_buffers_after_headers() {
        let mut core = core(3);
        assert_eq!(decode(&mut core, b"S", 0).status, DecodeStatus::HeadersReady);
        assert!(core.decode(&InputBuffer {
            data: b"P",
            bus_address: 0,
            decode_order_id: 0,
        })
        .is_err());

        let info = core.get_info().unwrap();
        core.set_info(&pp_for(&info), &info).unwrap();
        assert_eq!(
            decode(&mut core, b"P", 1),
            DecodeOutput::new(DecodeStatus::WaitingForBuffer, 0)
        );

        let request = core.get_buffer_info();
        assert_eq!(request.buffer_count, 3);
        assert_eq!(request.requested_size, 64 * 64 * 3 / 2);
        let mut bus = 0x1000;
        supply(&mut core, &mut bus);
        assert_eq!(core.get_buffer_info().buffer_count, 0);
        assert_eq!(decode(&mut core, b"P", 1).status, DecodeStatus::PictureDecoded);
    }

    #[test]
    fn reference_pictures_are_reordered_behind_non_reference() {
        let mut core = core(4);
        let mut bus = 0x1000;
        activate(&mut core, &mut bus);

        // Decode order I0 P3 B1 B2 -> display order I0 B1 B2 P3.
        for (id, unit) in [(0u64, b"P"), (3, b"P"), (1, b"b"), (2, b"b")] {
            assert_eq!(decode(&mut core, unit, id).status, DecodeStatus::PictureDecoded);
        }
        core.end_of_stream().unwrap();
        let order: Vec<u64> = drain(&mut core).iter().map(|p| p.decode_order_id).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(matches!(core.next_picture().unwrap(), NextPicture::EndOfStream));
    }

    #[test]
    fn exhausted_buffers_block_until_consumed() {
        let mut core = core(2);
        let mut bus = 0x1000;
        activate(&mut core, &mut bus);

        assert_eq!(decode(&mut core, b"P", 0).status, DecodeStatus::PictureDecoded);
        assert_eq!(decode(&mut core, b"P", 1).status, DecodeStatus::PictureDecoded);
        let blocked = decode(&mut core, b"P", 2);
        assert_eq!(blocked, DecodeOutput::new(DecodeStatus::NoDecodingBuffer, 0));

        let mut pictures = drain(&mut core);
        assert_eq!(pictures.len(), 2, "held reference picture is bumped out");
        core.picture_consumed(pictures.remove(0)).unwrap();
        assert_eq!(decode(&mut core, b"P", 2).status, DecodeStatus::PictureDecoded);

        let stale = DecodedPicture {
            pic_id: 999,
            decode_order_id: 0,
            keyframe: false,
            outputs: [None; MAX_PP_OUTPUTS],
        };
        assert_eq!(
            core.picture_consumed(stale),
            Err(AccelError::UnknownPicture(999))
        );
    }

    #[test]
    fn resolution_change_retires_old_buffers() {
        let mut core = core(2);
        let mut bus = 0x1000;
        activate(&mut core, &mut bus);
        assert_eq!(decode(&mut core, b"P", 0).status, DecodeStatus::PictureDecoded);
        assert_eq!(decode(&mut core, b"S", 1).status, DecodeStatus::StreamProcessed);

        assert_eq!(decode(&mut core, b"T", 1).status, DecodeStatus::HeadersReady);
        let info = core.get_info().unwrap();
        assert_eq!(info.width, 128);
        core.set_info(&pp_for(&info), &info).unwrap();

        // The idle buffer is released right away, the one holding picture 0
        // only after the picture comes back.
        let first = core.get_buffer_info();
        assert_eq!(
            first.buffer_to_free.map(|b| b.bus_address),
            Some(0x1000 + 0x10_0000)
        );
        assert_eq!(first.buffer_count, 2);
        assert_eq!(core.get_buffer_info().buffer_to_free, None);

        let picture = drain(&mut core).pop().unwrap();
        core.picture_consumed(picture).unwrap();
        assert_eq!(
            core.get_buffer_info().buffer_to_free.map(|b| b.bus_address),
            Some(0x1000)
        );
    }

    #[test]
    fn profile_support_statuses() {
        let mut core = core(2);
        assert_eq!(
            decode(&mut core, b"A", 0),
            DecodeOutput::new(DecodeStatus::AdvancedToolingDetected, 0)
        );
        assert_eq!(decode(&mut core, b"A", 0).status, DecodeStatus::HeadersReady);

        let mut other = self::core(2);
        assert_eq!(decode(&mut other, b"X", 0).status, DecodeStatus::StreamNotSupported);
    }

    #[test]
    fn injected_fault_after_pictures() {
        let config = CoreConfig {
            model: ModelParams {
                fault_after_pictures: Some(1),
                fault: FaultKind::SystemError,
                ..Default::default()
            },
        };
        let mut core = ScriptCore::init(&config).unwrap();
        let mut bus = 0x1000;
        activate(&mut core, &mut bus);
        assert_eq!(decode(&mut core, b"P", 0).status, DecodeStatus::PictureDecoded);
        assert_eq!(decode(&mut core, b"P", 1).status, DecodeStatus::SystemError);
    }

    #[test]
    fn released_core_rejects_calls() {
        let mut core = core(2);
        core.release();
        assert_eq!(core.next_picture().unwrap_err(), AccelError::Released);
        assert_eq!(core.end_of_stream(), Err(AccelError::Released));
    }

    #[test]
    fn oversized_sequence_is_not_supported() {
        let mut core = core(2);
        let output = decode(&mut core, b"W", 0);
        assert_eq!(output.status, DecodeStatus::StreamNotSupported);
        assert_eq!(output.consumed, 1);
        assert_eq!(core.get_info().unwrap_err(), AccelError::NoSequence);
    }
}
