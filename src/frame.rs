//! Stream framing (big-endian `i32` atoms, length-prefixed payloads).

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {length}")]
    LengthInvalid { length: i32 },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

pub fn encode_i32(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Write all chunks as one ordered, contiguous write.
///
/// Callers serialize access to the writer; a frame is never interleaved with
/// another writer's bytes.
pub fn send_many<W: Write>(writer: &mut W, parts: &[&[u8]]) -> std::io::Result<()> {
    let total = parts.iter().map(|part| part.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for part in parts {
        buf.extend_from_slice(part);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read one big-endian `i32`. Short reads accumulate; EOF mid-atom is an
    /// `UnexpectedEof` io error.
    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a length-prefixed payload: `i32` count `n >= 0` then `n` bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, FrameError> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(FrameError::LengthInvalid { length });
        }
        let length = length as usize;
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body)?;
        Ok(body)
    }
}
