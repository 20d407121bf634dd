//! OSC 1.0 subset codec: address pattern plus a typed argument list, serialized to the
//!  byte form both transports carry. Supported argument types are the ones the
//!  controller actually emits: `i` (int32), `f` (float32), `s` (string), `b` (blob).
//!
//! All fields are big-endian; strings are NUL-terminated and padded to a four byte
//!  boundary, blobs are length-prefixed and padded likewise.

use crate::error::BridgeError;
use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
    Blob(Vec<u8>),
}

impl OscArg {
    fn type_tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
            OscArg::Blob(_) => 'b',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub path: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(path: impl Into<String>, args: Vec<OscArg>) -> OscMessage {
        OscMessage {
            path: path.into(),
            args,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_padded_str(buf, &self.path);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        for arg in &self.args {
            tags.push(arg.type_tag());
        }
        put_padded_str(buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.put_i32(*v),
                OscArg::Float(v) => buf.put_f32(*v),
                OscArg::Str(s) => put_padded_str(buf, s),
                OscArg::Blob(b) => {
                    buf.put_i32(b.len() as i32);
                    buf.put_slice(b);
                    buf.put_bytes(0, (4 - b.len() % 4) % 4);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf
    }

    /// Decodes one complete message occupying the whole of `data`. Anything malformed -
    ///  bad padding, truncated arguments, unsupported type tags, trailing garbage - is a
    ///  [BridgeError::Protocol], never a panic.
    pub fn try_deser(data: &[u8]) -> Result<OscMessage, BridgeError> {
        let mut pos = 0;

        let path = take_padded_str(data, &mut pos)?.to_string();
        if !path.starts_with('/') {
            return Err(BridgeError::protocol(format!(
                "address pattern {:?} does not start with '/'",
                path
            )));
        }

        let tags = take_padded_str(data, &mut pos)?;
        let Some(tags) = tags.strip_prefix(',') else {
            return Err(BridgeError::protocol("type tag string does not start with ','"));
        };

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => OscArg::Int(take_i32(data, &mut pos)?),
                'f' => OscArg::Float(f32::from_bits(take_i32(data, &mut pos)? as u32)),
                's' => OscArg::Str(take_padded_str(data, &mut pos)?.to_string()),
                'b' => OscArg::Blob(take_blob(data, &mut pos)?),
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unsupported type tag '{}'",
                        other
                    )))
                }
            };
            args.push(arg);
        }

        if pos != data.len() {
            return Err(BridgeError::protocol(format!(
                "{} trailing bytes after message",
                data.len() - pos
            )));
        }

        Ok(OscMessage { path, args })
    }
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    // terminating NUL plus padding to a four byte boundary
    buf.put_bytes(0, 4 - s.len() % 4);
}

fn take_padded_str<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a str, BridgeError> {
    let len = data[*pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BridgeError::protocol("unterminated string"))?;

    let s = std::str::from_utf8(&data[*pos..*pos + len])
        .map_err(|e| BridgeError::protocol(format!("string is not valid UTF-8: {}", e)))?;

    let end = *pos + len + (4 - len % 4);
    if end > data.len() {
        return Err(BridgeError::protocol("truncated string padding"));
    }
    if data[*pos + len..end].iter().any(|&b| b != 0) {
        return Err(BridgeError::protocol("non-zero string padding"));
    }

    *pos = end;
    Ok(s)
}

fn take_i32(data: &[u8], pos: &mut usize) -> Result<i32, BridgeError> {
    if *pos + 4 > data.len() {
        return Err(BridgeError::protocol("truncated int32 argument"));
    }
    let v = i32::from_be_bytes([
        data[*pos],
        data[*pos + 1],
        data[*pos + 2],
        data[*pos + 3],
    ]);
    *pos += 4;
    Ok(v)
}

fn take_blob(data: &[u8], pos: &mut usize) -> Result<Vec<u8>, BridgeError> {
    let len = take_i32(data, pos)?;
    if len < 0 {
        return Err(BridgeError::protocol("negative blob length"));
    }
    let len = len as usize;

    let padded = len + (4 - len % 4) % 4;
    if *pos + padded > data.len() {
        return Err(BridgeError::protocol("truncated blob argument"));
    }

    let blob = data[*pos..*pos + len].to_vec();
    *pos += padded;
    Ok(blob)
}
