//! VP9 decode core model.
//!
//! VP9 has no separate sequence headers: the picture size and bit depth ride
//! on every key frame. The syntax reports a zero-length sequence unit the
//! first time a key frame announces new headers and the picture itself on
//! the following call. Every packet is one frame; superframes are not split.

use super::CodecFormat;
use super::bitstream::{BitReader, BitResult, BitstreamError};
use super::model::{FormatSyntax, ModelCore, ModelParams, ProfileSupport, StreamHeaders, SyntaxUnit};

pub type Vp9Core = ModelCore<Vp9Syntax>;

pub const FRAME_MARKER: u32 = 2;
pub const SYNC_CODE: u32 = 0x49_83_42;
const CS_RGB: u32 = 7;

#[derive(Debug, Default)]
pub struct Vp9Syntax {
    announced: Option<StreamHeaders>,
}

/// Fields of an uncompressed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub profile: u32,
    pub show_existing_frame: bool,
    pub key_frame: bool,
    pub show_frame: bool,
    /// Present on key frames only.
    pub size: Option<FrameSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
}

impl FrameHeader {
    /// Profiles 0 and 2 (4:2:0 at 8 and 10/12 bits) are decodable.
    pub fn support(&self) -> ProfileSupport {
        match self.profile {
            0 | 2 => ProfileSupport::Supported,
            _ => ProfileSupport::Unsupported,
        }
    }
}

pub fn parse_frame_header(data: &[u8]) -> BitResult<FrameHeader> {
    let mut reader = BitReader::new(data);
    if reader.read_bits(2)? != FRAME_MARKER {
        return Err(BitstreamError::BadMarker);
    }
    let profile_low = reader.read_bits(1)?;
    let profile_high = reader.read_bits(1)?;
    let profile = (profile_high << 1) | profile_low;
    if profile == 3 {
        reader.skip_bits(1)?;
    }
    if reader.read_flag()? {
        reader.skip_bits(3)?; // frame_to_show_map_idx
        return Ok(FrameHeader {
            profile,
            show_existing_frame: true,
            key_frame: false,
            show_frame: true,
            size: None,
        });
    }
    let key_frame = !reader.read_flag()?;
    let show_frame = reader.read_flag()?;
    reader.skip_bits(1)?; // error_resilient_mode
    if !key_frame {
        return Ok(FrameHeader {
            profile,
            show_existing_frame: false,
            key_frame,
            show_frame,
            size: None,
        });
    }

    if reader.read_bits(24)? != SYNC_CODE {
        return Err(BitstreamError::BadMarker);
    }
    let mut bit_depth = 8;
    if profile >= 2 {
        bit_depth = if reader.read_flag()? { 12 } else { 10 };
    }
    let color_space = reader.read_bits(3)?;
    if color_space != CS_RGB {
        reader.skip_bits(1)?; // color_range
        if profile == 1 || profile == 3 {
            reader.skip_bits(3)?; // subsampling_x, subsampling_y, reserved
        }
    } else if profile == 1 || profile == 3 {
        reader.skip_bits(1)?;
    }
    let width = reader.read_bits(16)? + 1;
    let height = reader.read_bits(16)? + 1;
    Ok(FrameHeader {
        profile,
        show_existing_frame: false,
        key_frame,
        show_frame,
        size: Some(FrameSize {
            width,
            height,
            bit_depth,
        }),
    })
}

impl FormatSyntax for Vp9Syntax {
    const FORMAT: CodecFormat = CodecFormat::Vp9;
    const REORDERS: bool = false;

    fn next_unit(&mut self, data: &[u8], _params: &ModelParams) -> SyntaxUnit {
        let len = data.len();
        let Ok(header) = parse_frame_header(data) else {
            return SyntaxUnit::Skip { len };
        };
        if header.show_existing_frame || !header.show_frame {
            return SyntaxUnit::Skip { len };
        }
        if let Some(size) = header.size {
            let headers = StreamHeaders {
                width: size.width,
                height: size.height,
                bit_depth: size.bit_depth,
                profile: header.profile,
                support: header.support(),
            };
            if self.announced != Some(headers) {
                self.announced = Some(headers);
                let consumed = if headers.support == ProfileSupport::Supported {
                    0
                } else {
                    len
                };
                return SyntaxUnit::Sequence {
                    headers,
                    len: consumed,
                };
            }
        } else if self.announced.is_none() {
            // Inter frame before the first key frame.
            return SyntaxUnit::Skip { len };
        }
        SyntaxUnit::Picture {
            reference: true,
            keyframe: header.key_frame,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::synth;

    #[test]
    fn parses_key_frame_size() {
        let frame = synth::vp9_frame(true, 1280, 720, 10, 32);
        let header = parse_frame_header(&frame).unwrap();
        assert!(header.key_frame);
        assert_eq!(header.profile, 2);
        assert_eq!(
            header.size,
            Some(FrameSize {
                width: 1280,
                height: 720,
                bit_depth: 10
            })
        );
    }

    #[test]
    fn key_frame_announces_headers_once() {
        let params = ModelParams::default();
        let mut syntax = Vp9Syntax::default();
        let key = synth::vp9_frame(true, 320, 240, 8, 16);
        let SyntaxUnit::Sequence { headers, len } = syntax.next_unit(&key, &params) else {
            panic!("expected sequence unit");
        };
        assert_eq!(len, 0);
        assert_eq!((headers.width, headers.height), (320, 240));
        assert_eq!(
            syntax.next_unit(&key, &params),
            SyntaxUnit::Picture {
                reference: true,
                keyframe: true,
                len: key.len()
            }
        );
        let inter = synth::vp9_frame(false, 320, 240, 8, 16);
        assert_eq!(
            syntax.next_unit(&inter, &params),
            SyntaxUnit::Picture {
                reference: true,
                keyframe: false,
                len: inter.len()
            }
        );
    }

    #[test]
    fn garbage_is_skipped_whole() {
        let params = ModelParams::default();
        let mut syntax = Vp9Syntax::default();
        assert_eq!(
            syntax.next_unit(&[0x00, 0x11, 0x22], &params),
            SyntaxUnit::Skip { len: 3 }
        );
    }
}
