//! RPC framing: `u32 LE length + u32 LE crc32c + payload`.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame of {got_bytes} bytes exceeds limit of {max_frame_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: header says {expected:#010x}, payload sums to {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

/// Read `buf.len()` bytes. `Ok(false)` means EOF landed exactly on a frame
/// boundary; EOF mid-read is an error.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 && at_boundary {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            )
            .into());
        }
        filled += n;
    }
    Ok(true)
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

    /// The next frame payload, or `None` on a clean EOF.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_full(&mut self.reader, &mut header, true)? {
            return Ok(None);
        }

        let length = u32::from_le_bytes(header[..4].try_into().expect("4 bytes")) as usize;
        let expected = u32::from_le_bytes(header[4..].try_into().expect("4 bytes"));
        if length == 0 {
            return Err(FrameError::EmptyFrame);
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut payload = vec![0u8; length];
        read_full(&mut self.reader, &mut payload, false)?;

        let got = crc32c(&payload);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(payload))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyFrame);
        }
        if payload.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: payload.len(),
            });
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[4..].copy_from_slice(&crc32c(payload).to_le_bytes());
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        Ok(())
    }
}
