//! Strip frames exchanged over worker pipes.
//!
//! # Frame Layout
//! ```text
//! [24-byte header] [width * height * channels pixel bytes]
//!
//! Header (little endian):
//!   magic:    u32   (0x53545250, "STRP")
//!   index:    u32   (strip index)
//!   offset_x: u32   (column in the source image)
//!   width:    u32
//!   height:   u32
//!   channels: u32
//! ```
//!
//! A reader that hits end-of-file before the first header byte reports `Ok(None)`,
//! which is how a pool worker learns there are no more tasks. End-of-file anywhere
//! else is a truncated frame and is reported as a protocol error, so callers never
//! observe a partial pixel buffer.

use crate::error::{StripError, StripResult};
use crate::raster::{Image, Shape, Strip};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic number at the start of every frame.
pub const FRAME_MAGIC: u32 = 0x5354_5250;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 24;

/// Largest payload a reader will allocate for (1 GiB).
pub const MAX_PAYLOAD_BYTES: usize = 1 << 30;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Strip index.
    pub index: u32,
    /// Column in the source image.
    pub offset_x: u32,
    /// Payload dimensions.
    pub shape: Shape,
}

/// Serialize the header for `strip`.
pub fn encode_header(strip: &Strip) -> StripResult<BytesMut> {
    let index = u32::try_from(strip.index)
        .map_err(|_| StripError::Protocol(format!("strip index {} exceeds u32", strip.index)))?;
    let shape = strip.shape();
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u32_le(FRAME_MAGIC);
    buf.put_u32_le(index);
    buf.put_u32_le(strip.offset_x);
    buf.put_u32_le(shape.width);
    buf.put_u32_le(shape.height);
    buf.put_u32_le(shape.channels);
    Ok(buf)
}

/// Parse and validate a frame header.
pub fn decode_header(mut buf: &[u8]) -> StripResult<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return Err(StripError::Protocol(format!(
            "frame header needs {} bytes, got {}",
            HEADER_LEN,
            buf.len()
        )));
    }
    let magic = buf.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(StripError::Protocol(format!(
            "invalid frame magic: expected 0x{:08X}, got 0x{:08X}",
            FRAME_MAGIC, magic
        )));
    }
    let index = buf.get_u32_le();
    let offset_x = buf.get_u32_le();
    let shape = Shape {
        width: buf.get_u32_le(),
        height: buf.get_u32_le(),
        channels: buf.get_u32_le(),
    };
    let payload = (shape.width as u64) * (shape.height as u64) * (shape.channels as u64);
    if payload > MAX_PAYLOAD_BYTES as u64 {
        return Err(StripError::Protocol(format!(
            "frame payload of {} bytes exceeds limit of {} bytes",
            payload, MAX_PAYLOAD_BYTES
        )));
    }
    Ok(FrameHeader {
        index,
        offset_x,
        shape,
    })
}

/// Write one complete frame and flush.
pub async fn write_strip<W>(writer: &mut W, strip: &Strip) -> StripResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(strip)?;
    writer.write_all(&header).await?;
    writer.write_all(strip.image.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame, or `None` on a clean end-of-stream.
pub async fn read_strip<R>(reader: &mut R) -> StripResult<Option<Strip>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let filled = read_full(reader, &mut header).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < HEADER_LEN {
        return Err(StripError::Protocol(format!(
            "stream closed inside frame header ({} of {} bytes)",
            filled, HEADER_LEN
        )));
    }
    let header = decode_header(&header)?;

    let mut pixels = vec![0u8; header.shape.byte_len()];
    let got = read_full(reader, &mut pixels).await?;
    if got < pixels.len() {
        return Err(StripError::Protocol(format!(
            "stream closed inside frame payload ({} of {} bytes)",
            got,
            pixels.len()
        )));
    }
    let image = Image::with_shape(header.shape, pixels)?;
    Ok(Some(Strip::new(
        header.index as usize,
        header.offset_x,
        image,
    )))
}

/// Fill `buf` until it is full or the stream ends; returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
