//! Multipart message codec.
//!
//! A message is a big-endian `u32` frame count followed by each frame as a
//! big-endian `u32` length and its bytes.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, ErrorKind, Result};

/// Largest message the decoder accepts before treating the stream as corrupt.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

pub fn encode(frames: &[Bytes], dst: &mut BytesMut) {
    let body: usize = frames.iter().map(|f| LEN_PREFIX + f.len()).sum();
    dst.reserve(LEN_PREFIX + body);
    dst.put_u32(frames.len() as u32);
    for frame in frames {
        dst.put_u32(frame.len() as u32);
        dst.put_slice(frame);
    }
}

/// Removes one complete message from the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched when the message is not
/// fully buffered yet.
pub fn decode(src: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let count = BigEndian::read_u32(&src[..LEN_PREFIX]) as usize;

    let mut offset = LEN_PREFIX;
    let mut bounds = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if src.len() < offset + LEN_PREFIX {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&src[offset..offset + LEN_PREFIX]) as usize;
        offset += LEN_PREFIX;
        if offset + len > MAX_MESSAGE_LEN {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("message exceeds {} bytes", MAX_MESSAGE_LEN),
            ));
        }
        bounds.push((offset, len));
        offset += len;
    }
    if src.len() < offset {
        return Ok(None);
    }

    let message = src.split_to(offset).freeze();
    let frames = bounds
        .into_iter()
        .map(|(start, len)| message.slice(start..start + len))
        .collect();
    Ok(Some(frames))
}
