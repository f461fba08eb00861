//! Length-prefixed frame codec.
//!
//! One frame per message: `<decimal-ascii-length>!<payload>`. The length
//! prefix is written together with the payload as one logical write, so the
//! peer never observes a partial prefix. Reading walks the stream one byte at
//! a time until the `!` delimiter, parses the accumulated digits, then reads
//! exactly that many payload bytes, looping on short reads.
//!
//! The codec is transport-agnostic: anything `Read`/`Write` works, which is
//! how the same code serves plain TCP in tests and TLS streams in production.

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Byte separating the decimal length from the payload.
pub const LENGTH_DELIMITER: u8 = b'!';

/// Maximum accepted payload size. Frames claiming more are rejected before
/// any payload allocation.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Maximum digits in a length prefix (enough for MAX_FRAME_SIZE).
const MAX_LENGTH_DIGITS: usize = 10;

/// Errors produced by the frame codec.
#[derive(Debug)]
pub enum FrameError {
    /// Peer closed the connection (possibly mid-frame).
    Closed,
    /// The length prefix contained a non-digit or was empty.
    MalformedLength,
    /// The declared payload length exceeds MAX_FRAME_SIZE.
    Oversize(usize),
    /// Underlying transport error.
    Io(io::Error),
    /// The payload was framed correctly but is not valid JSON for the
    /// expected type.
    Decode(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed by peer"),
            Self::MalformedLength => write!(f, "malformed frame length prefix"),
            Self::Oversize(len) => {
                write!(f, "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Decode(msg) => write!(f, "payload decode error: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// True for the error kinds a timed-out blocking read produces.
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Serialize `msg` and write it as one frame. The prefix and payload go out
/// in a single write call so no partial length prefix is ever emitted.
pub fn send_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg).map_err(|e| FrameError::Decode(e.to_string()))?;
    write_frame(w, &payload)
}

/// Write one raw frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let mut frame = Vec::with_capacity(payload.len() + MAX_LENGTH_DIGITS + 1);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.push(LENGTH_DELIMITER);
    frame.extend_from_slice(payload);
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Decode a frame payload into a typed message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::Decode(e.to_string()))
}

/// Incremental frame reader over a blocking stream.
///
/// Connection threads interleave inbound frames with outbound deliveries, so
/// the underlying stream carries a short read timeout. `poll_frame` turns a
/// timeout *before* a frame has started into `Ok(None)`; once the first
/// length byte has arrived the rest of the frame is read to completion,
/// retrying through timeouts.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Access the underlying stream, e.g. to write replies.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Try to read one frame. Returns `Ok(None)` if the read timed out
    /// before any byte of a frame arrived.
    pub fn poll_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let first = match self.read_byte() {
            Ok(b) => b,
            Err(FrameError::Io(ref e)) if is_timeout(e) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.finish_frame(first).map(Some)
    }

    /// Read one frame, blocking through read timeouts until it arrives.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }
        }
    }

    /// Read and decode one frame.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let frame = self.read_frame()?;
        decode(&frame)
    }

    fn finish_frame(&mut self, first: u8) -> Result<Vec<u8>, FrameError> {
        let mut digits = Vec::with_capacity(MAX_LENGTH_DIGITS);
        let mut byte = first;
        loop {
            if byte == LENGTH_DELIMITER {
                break;
            }
            if !byte.is_ascii_digit() || digits.len() >= MAX_LENGTH_DIGITS {
                return Err(FrameError::MalformedLength);
            }
            digits.push(byte);
            byte = self.read_byte_blocking()?;
        }
        if digits.is_empty() {
            return Err(FrameError::MalformedLength);
        }
        // Digits only, bounded length: cannot fail.
        let len: usize = String::from_utf8_lossy(&digits)
            .parse()
            .map_err(|_| FrameError::MalformedLength)?;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversize(len));
        }

        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.inner.read(&mut payload[filled..]) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => filled += n,
                Err(ref e) if is_timeout(e) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(payload)
    }

    /// Read one byte, surfacing timeouts to the caller.
    fn read_byte(&mut self) -> Result<u8, FrameError> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(_) => return Ok(buf[0]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read one byte mid-frame, retrying through timeouts.
    fn read_byte_blocking(&mut self) -> Result<u8, FrameError> {
        loop {
            match self.read_byte() {
                Err(FrameError::Io(ref e)) if is_timeout(e) => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).unwrap();
        let mut reader = FrameReader::new(Cursor::new(buf));
        reader.read_frame().unwrap()
    }

    #[test]
    fn frame_round_trip_empty() {
        assert_eq!(round_trip(b""), b"");
    }

    #[test]
    fn frame_round_trip_small() {
        assert_eq!(round_trip(b"hello"), b"hello");
    }

    #[test]
    fn frame_round_trip_large() {
        // Larger than 64KB per the framing contract.
        let payload = vec![0xAB; 100 * 1024];
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn frames_back_to_back() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one").unwrap();
        write_frame(&mut buf, b"").unwrap();
        write_frame(&mut buf, b"three").unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read_frame().unwrap(), b"one");
        assert_eq!(reader.read_frame().unwrap(), b"");
        assert_eq!(reader.read_frame().unwrap(), b"three");
        assert!(matches!(reader.read_frame(), Err(FrameError::Closed)));
    }

    #[test]
    fn wire_bytes_use_decimal_prefix_and_delimiter() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        assert_eq!(buf, b"3!abc");
    }

    #[test]
    fn malformed_length_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"12x!abc".to_vec()));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::MalformedLength)
        ));

        let mut reader = FrameReader::new(Cursor::new(b"!abc".to_vec()));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::MalformedLength)
        ));
    }

    #[test]
    fn oversize_length_rejected_before_allocation() {
        let mut reader = FrameReader::new(Cursor::new(b"999999999!".to_vec()));
        assert!(matches!(reader.read_frame(), Err(FrameError::Oversize(_))));
    }

    #[test]
    fn peer_close_mid_frame_is_connection_error() {
        // Length prefix promises 10 bytes but only 3 arrive.
        let mut reader = FrameReader::new(Cursor::new(b"10!abc".to_vec()));
        assert!(matches!(reader.read_frame(), Err(FrameError::Closed)));
    }

    #[test]
    fn poll_returns_none_on_idle_timeout() {
        struct TimesOut;
        impl Read for TimesOut {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out"))
            }
        }
        let mut reader = FrameReader::new(TimesOut);
        assert!(reader.poll_frame().unwrap().is_none());
    }

    #[test]
    fn typed_send_and_decode() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Probe {
            n: u32,
            s: String,
        }
        let msg = Probe {
            n: 42,
            s: "x".into(),
        };
        let mut buf = Vec::new();
        send_message(&mut buf, &msg).unwrap();
        let mut reader = FrameReader::new(Cursor::new(buf));
        let back: Probe = reader.read_message().unwrap();
        assert_eq!(back, msg);
    }
}
