//! Length-prefixed framing for the TCP side. A raw byte stream has no message
//!  boundaries, and read-call boundaries are not a substitute - the transport may split
//!  or coalesce messages arbitrarily. Each message is therefore preceded by its payload
//!  length as a u32 in network byte order.

use crate::error::BridgeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 4;

/// Appends one framed message to `buf`.
pub fn put_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Takes one complete frame off the front of `buf`, leaving any remainder in place.
///  Returns `Ok(None)` if the buffer does not yet hold a complete frame - partial data
///  is retained, never discarded. A frame announcing more than `max_frame_size` bytes
///  is a protocol violation.
pub fn try_take_frame(
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<Bytes>, BridgeError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if payload_len > max_frame_size {
        return Err(BridgeError::protocol(format!(
            "frame of {} bytes exceeds the maximum of {}",
            payload_len, max_frame_size
        )));
    }

    if buf.len() < FRAME_HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(payload_len).freeze()))
}
