//! Framed wire codec for the peer socket.
//!
//! Every frame starts with a one-byte kind tag and a length-prefixed path,
//! followed by a kind-specific payload. All integers are little-endian.
//! Frames are always written with a single `write_all` of one contiguous
//! buffer so that the per-socket write mutex is the only serialization the
//! stream needs.

use std::io::{self, Read};

/// Upper bound on the path length accepted in a frame header. Anything
/// larger is a corrupted or hostile stream.
const MAX_PATH_LEN: u32 = 64 * 1024;

mod tag {
    pub const OPEN: u8 = 100;
    pub const CLOSE: u8 = 101;
    pub const READ_REQUEST: u8 = 102;
    pub const READ_ACK: u8 = 103;
    pub const WRITE: u8 = 104;
}

/// Role of a pipe endpoint, as carried by OPEN and CLOSE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    #[inline]
    fn to_wire(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    fn from_wire(b: u8) -> io::Result<Self> {
        match b {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            _ => Err(bad_frame("unknown open mode")),
        }
    }
}

/// One decoded frame.
///
/// For [`Frame::Write`] the payload bytes stay on the stream: the dispatcher
/// hands the stream to the addressed pipe, which must consume exactly `size`
/// bytes before the next frame can be decoded.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Open { path: String, mode: OpenMode },
    Close { path: String, mode: OpenMode },
    ReadRequest { path: String, size: u64 },
    ReadAck { path: String, size: u64 },
    Write { path: String, size: u64 },
}

fn bad_frame(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_path<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)?;
    if len == 0 || len > MAX_PATH_LEN {
        return Err(bad_frame("path length out of bounds"));
    }
    let mut raw = vec![0; len as usize];
    r.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| bad_frame("path is not valid UTF-8"))
}

/// Decodes the next frame off `r`. An `UnexpectedEof` before the first
/// header byte means the peer closed the connection cleanly.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Frame> {
    let kind = read_u8(r)?;
    let path = read_path(r)?;
    match kind {
        tag::OPEN => Ok(Frame::Open {
            path,
            mode: OpenMode::from_wire(read_u8(r)?)?,
        }),
        tag::CLOSE => Ok(Frame::Close {
            path,
            mode: OpenMode::from_wire(read_u8(r)?)?,
        }),
        tag::READ_REQUEST => Ok(Frame::ReadRequest {
            path,
            size: read_u64(r)?,
        }),
        tag::READ_ACK => Ok(Frame::ReadAck {
            path,
            size: read_u64(r)?,
        }),
        tag::WRITE => Ok(Frame::Write {
            path,
            size: read_u64(r)?,
        }),
        _ => Err(bad_frame("unknown frame kind")),
    }
}

fn header(kind: u8, path: &str, payload_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + path.len() + payload_len);
    buf.push(kind);
    buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf
}

pub fn encode_open(path: &str, mode: OpenMode) -> Vec<u8> {
    let mut buf = header(tag::OPEN, path, 1);
    buf.push(mode.to_wire());
    buf
}

pub fn encode_close(path: &str, mode: OpenMode) -> Vec<u8> {
    let mut buf = header(tag::CLOSE, path, 1);
    buf.push(mode.to_wire());
    buf
}

pub fn encode_read_request(path: &str, size: u64) -> Vec<u8> {
    let mut buf = header(tag::READ_REQUEST, path, 8);
    buf.extend_from_slice(&size.to_le_bytes());
    buf
}

pub fn encode_read_ack(path: &str, size: u64) -> Vec<u8> {
    let mut buf = header(tag::READ_ACK, path, 8);
    buf.extend_from_slice(&size.to_le_bytes());
    buf
}

/// Encodes a WRITE frame with its payload inline, so header and data go out
/// in one write.
pub fn encode_write(path: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = header(tag::WRITE, path, 8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn open_and_close_roundtrip() {
        let mut stream = Cursor::new(encode_open("/x", OpenMode::Write));
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Frame::Open {
                path: "/x".into(),
                mode: OpenMode::Write
            }
        );

        let mut stream = Cursor::new(encode_close("/x", OpenMode::Read));
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Frame::Close {
                path: "/x".into(),
                mode: OpenMode::Read
            }
        );
    }

    #[test]
    fn read_frames_roundtrip() {
        let mut stream = Cursor::new(encode_read_request("/long/path", 4096));
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Frame::ReadRequest {
                path: "/long/path".into(),
                size: 4096
            }
        );

        let mut stream = Cursor::new(encode_read_ack("/long/path", 17));
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Frame::ReadAck {
                path: "/long/path".into(),
                size: 17
            }
        );
    }

    #[test]
    fn write_frame_leaves_payload_on_the_stream() {
        let mut stream = Cursor::new(encode_write("/x", b"hello"));
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Frame::Write {
                path: "/x".into(),
                size: 5
            }
        );
        let mut payload = [0; 5];
        stream.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn rejects_unknown_kind_and_mode() {
        let mut garbled = encode_open("/x", OpenMode::Read);
        garbled[0] = 42;
        assert!(read_frame(&mut Cursor::new(garbled)).is_err());

        let mut garbled = encode_open("/x", OpenMode::Read);
        *garbled.last_mut().unwrap() = 9;
        assert!(read_frame(&mut Cursor::new(garbled)).is_err());
    }

    #[test]
    fn rejects_oversized_path() {
        let mut buf = vec![tag::OPEN];
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn eof_surfaces_as_unexpected_eof() {
        let err = read_frame(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
