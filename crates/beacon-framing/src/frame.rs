//! Low-level frame envelope: `[u32 len][u8 type][payload][u32 len]`.

use std::io::{self, Read, Write};

use crate::wire::{read_u32, write_u32};

/// Bytes consumed by the trailing length field.
pub const FRAME_TRAILER_LEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    SessionSummary = 0x01,
    LogMessage = 0x02,
    MetricDefinition = 0x03,
    MetricSample = 0x04,
    SessionEnd = 0x05,
    FileRoll = 0x06,
    ExceptionInfo = 0x07,
    ThreadInfo = 0x08,
}

impl FrameType {
    pub fn from_u8(v: u8) -> crate::Result<Self> {
        Ok(match v {
            0x01 => FrameType::SessionSummary,
            0x02 => FrameType::LogMessage,
            0x03 => FrameType::MetricDefinition,
            0x04 => FrameType::MetricSample,
            0x05 => FrameType::SessionEnd,
            0x06 => FrameType::FileRoll,
            0x07 => FrameType::ExceptionInfo,
            0x08 => FrameType::ThreadInfo,
            other => return Err(crate::FramingError::UnknownFrameType(other)),
        })
    }
}

/// Write one frame: length, type byte, payload, length again.
pub fn write_frame<W: Write>(w: &mut W, frame_type: FrameType, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    write_u32(w, len)?;
    w.write_all(&[frame_type as u8])?;
    w.write_all(payload)?;
    write_u32(w, len)?;
    Ok(())
}

/// What a single read-attempt found.
pub enum FrameRead {
    /// A complete, symmetric frame.
    Frame { frame_type: u8, payload: Vec<u8> },
    /// Clean end of file, nothing read yet — no more frames.
    Eof,
    /// EOF (or a length mismatch) in the middle of a frame: the file's tail
    /// is truncated. The reader must stop here, not error out.
    Truncated,
}

/// Read one frame from `r`. Does not distinguish "truncated" from
/// "corrupt" at this layer — [`crate::SessionFileReader`] decides that
/// based on position (a truncated tail is expected after a crash; the same
/// condition mid-file is corruption).
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<FrameRead> {
    let len = match read_u32(r) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Eof),
        Err(e) => return Err(e),
    };

    let mut type_byte = [0u8; 1];
    if let Err(e) = r.read_exact(&mut type_byte) {
        return if e.kind() == io::ErrorKind::UnexpectedEof {
            Ok(FrameRead::Truncated)
        } else {
            Err(e)
        };
    }

    let mut payload = vec![0u8; len as usize];
    if let Err(e) = r.read_exact(&mut payload) {
        return if e.kind() == io::ErrorKind::UnexpectedEof {
            Ok(FrameRead::Truncated)
        } else {
            Err(e)
        };
    }

    let trailing_len = match read_u32(r) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Truncated),
        Err(e) => return Err(e),
    };

    if trailing_len != len {
        return Ok(FrameRead::Truncated);
    }

    Ok(FrameRead::Frame {
        frame_type: type_byte[0],
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::LogMessage, b"hello").unwrap();

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).unwrap() {
            FrameRead::Frame {
                frame_type,
                payload,
            } => {
                assert_eq!(frame_type, FrameType::LogMessage as u8);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_frame(&mut cursor).unwrap(), FrameRead::Eof));
    }

    #[test]
    fn truncated_tail_is_detected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::LogMessage, b"hello world").unwrap();
        // Chop off the last 6 bytes: part of the payload and the trailer.
        buf.truncate(buf.len() - 6);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            FrameRead::Truncated
        ));
    }

    #[test]
    fn mismatched_trailer_is_truncated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::LogMessage, b"hello").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            FrameRead::Truncated
        ));
    }
}
