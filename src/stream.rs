//! Elementary stream framing for file input.
//!
//! H.264 and HEVC are read as raw Annex B byte streams and split into access
//! units. VP9 is read from IVF, whose frame headers carry the presentation
//! timestamp.

use std::io::{Cursor, Read, Write};

use anyhow::{Context, Result, anyhow, bail};

use crate::accel::{CodecFormat, h264, hevc};

const IVF_SIGNATURE: &[u8; 4] = b"DKIF";
const IVF_HEADER_LEN: u16 = 32;
const IVF_FRAME_HEADER_LEN: usize = 12;

/// One packet ready for `DecodeSession::put_packet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_denominator: u32,
    pub timebase_numerator: u32,
    pub frame_count: u32,
}

/// Splits a whole input file into packets for `format`.
pub fn demux_stream(format: CodecFormat, data: &[u8]) -> Result<Vec<StreamPacket>> {
    let units = match format {
        CodecFormat::H264 => h264::access_units(data),
        CodecFormat::Hevc => hevc::access_units(data),
        CodecFormat::Vp9 => {
            let (_, frames) = read_ivf(data)?;
            return Ok(frames);
        }
    };
    if units.is_empty() {
        bail!("no {format} access units found");
    }
    Ok(units
        .into_iter()
        .enumerate()
        .map(|(index, data)| StreamPacket {
            data,
            pts: None,
            dts: Some(index as i64),
        })
        .collect())
}

pub fn read_ivf(data: &[u8]) -> Result<(IvfHeader, Vec<StreamPacket>)> {
    let mut cursor = Cursor::new(data);
    let mut signature = [0u8; 4];
    cursor.read_exact(&mut signature).context("IVF signature")?;
    if &signature != IVF_SIGNATURE {
        bail!("not an IVF file");
    }
    let _version = read_u16(&mut cursor)?;
    let header_len = read_u16(&mut cursor)?;
    if header_len < IVF_HEADER_LEN {
        bail!("invalid IVF header length {header_len}");
    }
    let mut fourcc = [0u8; 4];
    cursor.read_exact(&mut fourcc).context("IVF fourcc")?;
    let header = IvfHeader {
        fourcc,
        width: read_u16(&mut cursor)?,
        height: read_u16(&mut cursor)?,
        timebase_denominator: read_u32(&mut cursor)?,
        timebase_numerator: read_u32(&mut cursor)?,
        frame_count: read_u32(&mut cursor)?,
    };
    cursor.set_position(header_len as u64);

    let mut frames = Vec::new();
    while (cursor.position() as usize) < data.len() {
        if data.len() - (cursor.position() as usize) < IVF_FRAME_HEADER_LEN {
            bail!("truncated IVF frame header");
        }
        let size = read_u32(&mut cursor)? as usize;
        let pts = read_u64(&mut cursor)? as i64;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(size)
            .ok_or_else(|| anyhow!("IVF frame length overflow"))?;
        if end > data.len() {
            bail!("IVF frame {} exceeds file bounds", frames.len());
        }
        frames.push(StreamPacket {
            data: data[start..end].to_vec(),
            pts: Some(pts),
            dts: None,
        });
        cursor.set_position(end as u64);
    }
    Ok((header, frames))
}

/// Writes a VP9 IVF file.
pub fn write_ivf<W: Write>(
    out: &mut W,
    width: u16,
    height: u16,
    frames: &[(i64, &[u8])],
) -> Result<()> {
    out.write_all(IVF_SIGNATURE)?;
    out.write_all(&0u16.to_le_bytes())?;
    out.write_all(&IVF_HEADER_LEN.to_le_bytes())?;
    out.write_all(b"VP90")?;
    out.write_all(&width.to_le_bytes())?;
    out.write_all(&height.to_le_bytes())?;
    out.write_all(&30u32.to_le_bytes())?;
    out.write_all(&1u32.to_le_bytes())?;
    out.write_all(&(frames.len() as u32).to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;
    for (pts, data) in frames {
        out.write_all(&(data.len() as u32).to_le_bytes())?;
        out.write_all(&(*pts as u64).to_le_bytes())?;
        out.write_all(data)?;
    }
    Ok(())
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).context("IVF u16")?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).context("IVF u32")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).context("IVF u64")?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::synth::SynthStream;

    #[test]
    fn ivf_frames_keep_timestamps() {
        let packets = SynthStream::new(CodecFormat::Vp9, 96, 64).packets(3);
        let frames: Vec<(i64, &[u8])> = packets
            .iter()
            .map(|p| (p.pts * 100, p.data.as_slice()))
            .collect();
        let mut file = Vec::new();
        write_ivf(&mut file, 96, 64, &frames).unwrap();

        let (header, decoded) = read_ivf(&file).unwrap();
        assert_eq!(&header.fourcc, b"VP90");
        assert_eq!((header.width, header.height, header.frame_count), (96, 64, 3));
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].pts, Some(200));
        assert_eq!(decoded[1].data, packets[1].data);
    }

    #[test]
    fn truncated_ivf_is_rejected() {
        let packets = SynthStream::new(CodecFormat::Vp9, 96, 64).packets(1);
        let mut file = Vec::new();
        write_ivf(&mut file, 96, 64, &[(0, packets[0].data.as_slice())]).unwrap();
        file.truncate(file.len() - 3);
        let err = read_ivf(&file).unwrap_err();
        assert!(err.to_string().contains("exceeds file bounds"));
        assert!(read_ivf(b"RIFF").is_err());
    }

    #[test]
    fn annex_b_input_is_split_per_picture() {
        let stream = SynthStream::new(CodecFormat::H264, 64, 64).gop("IPPP");
        let data: Vec<u8> = stream.packets(6).into_iter().flat_map(|p| p.data).collect();
        let packets = demux_stream(CodecFormat::H264, &data).unwrap();
        assert_eq!(packets.len(), 6);
        assert_eq!(packets[5].dts, Some(5));
        assert!(demux_stream(CodecFormat::Hevc, &[]).is_err());
    }
}
