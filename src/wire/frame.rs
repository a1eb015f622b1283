//! Connection preamble and length-prefixed framing.
//!
//! Every frame is a big-endian `u32` length followed by the payload. The
//! client ends a stream with a zero-length frame.

use std::io::{self, Read};

use thiserror::Error;

/// Bytes opening every relay connection.
pub const MAGIC: [u8; 4] = *b"FRLY";
/// Default maximum payload size accepted on either side.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20; // 1 MiB

const LEN_PREFIX: usize = 4;
const PREAMBLE_LEN: usize = MAGIC.len() + 1;

/// Exchange pattern announced in the preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Any number of request/ack exchanges until the client sends "done".
    Stream = 1,
    /// Exactly one exchange, after which the server closes.
    Unary = 2,
}

/// Opening bytes of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    pub mode: Mode,
}

impl Preamble {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    pub fn encode(self) -> [u8; PREAMBLE_LEN] {
        let mut out = [0u8; PREAMBLE_LEN];
        out[..MAGIC.len()].copy_from_slice(&MAGIC);
        out[MAGIC.len()] = self.mode as u8;
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let Some((magic, rest)) = bytes.split_first_chunk::<4>() else {
            return Err(FrameError::BadPreamble);
        };
        if *magic != MAGIC {
            return Err(FrameError::BadPreamble);
        }
        match rest {
            [1] => Ok(Self::new(Mode::Stream)),
            [2] => Ok(Self::new(Mode::Unary)),
            [other] => Err(FrameError::UnknownMode(*other)),
            _ => Err(FrameError::BadPreamble),
        }
    }
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("connection preamble is not a relay preamble")]
    BadPreamble,
    #[error("unknown relay mode {0:#04x}")]
    UnknownMode(u8),
    #[error("connection closed inside a frame")]
    Truncated,
    #[error("connection closed before the preamble")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8], max_size: usize) -> Result<Vec<u8>, FrameError> {
    let too_large = || FrameError::TooLarge {
        size: payload.len(),
        max: max_size,
    };
    if payload.len() > max_size {
        return Err(too_large());
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large())?;
    let mut framed = Vec::with_capacity(payload.len().saturating_add(LEN_PREFIX));
    framed.extend(len.to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// The zero-length frame ending a stream.
pub fn done_frame() -> [u8; LEN_PREFIX] {
    [0; LEN_PREFIX]
}

/// Outcome of one [`FrameReader::poll`].
#[derive(Debug, PartialEq, Eq)]
pub enum FramePoll {
    Frame(Vec<u8>),
    /// Zero-length frame: the peer has nothing more to send.
    Done,
    /// The read timed out before a whole frame arrived.
    Pending,
    /// Clean end of stream between frames.
    Eof,
}

/// Incremental frame decoder.
///
/// Partial input survives read timeouts, so callers can wake periodically
/// to check for shutdown without losing bytes.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_size: usize,
}

impl FrameReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_size,
        }
    }

    /// Read until the connection preamble is complete.
    ///
    /// `Ok(None)` means the read timed out first.
    pub fn poll_preamble(&mut self, src: &mut impl Read) -> Result<Option<Preamble>, FrameError> {
        if !self.fill(src, PREAMBLE_LEN)? {
            return Err(FrameError::Closed);
        }
        if self.buf.len() < PREAMBLE_LEN {
            return Ok(None);
        }
        let preamble = Preamble::parse(&self.buf[..PREAMBLE_LEN])?;
        self.buf.drain(..PREAMBLE_LEN);
        Ok(Some(preamble))
    }

    /// Read the next frame.
    pub fn poll(&mut self, src: &mut impl Read) -> Result<FramePoll, FrameError> {
        loop {
            if let Some(polled) = self.take_frame()? {
                return Ok(polled);
            }
            let want = self.wanted();
            if !self.fill(src, want)? {
                return if self.buf.is_empty() {
                    Ok(FramePoll::Eof)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            if self.buf.len() < want {
                return Ok(FramePoll::Pending);
            }
        }
    }

    fn wanted(&self) -> usize {
        match self.declared_len() {
            Some(len) => LEN_PREFIX.saturating_add(len),
            None => LEN_PREFIX,
        }
    }

    fn declared_len(&self) -> Option<usize> {
        let prefix = self.buf.first_chunk::<LEN_PREFIX>()?;
        usize::try_from(u32::from_be_bytes(*prefix)).ok()
    }

    fn take_frame(&mut self) -> Result<Option<FramePoll>, FrameError> {
        let Some(len) = self.declared_len() else {
            return Ok(None);
        };
        if len > self.max_size {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_size,
            });
        }
        if len == 0 {
            self.buf.drain(..LEN_PREFIX);
            return Ok(Some(FramePoll::Done));
        }
        let end = LEN_PREFIX + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let payload = self.buf[LEN_PREFIX..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(FramePoll::Frame(payload)))
    }

    /// Read until `buf` holds `want` bytes or the source stalls.
    ///
    /// Returns `false` on end of stream.
    fn fill(&mut self, src: &mut impl Read, want: usize) -> Result<bool, FrameError> {
        let mut chunk = [0u8; 8192];
        while self.buf.len() < want {
            let limit = (want - self.buf.len()).min(chunk.len());
            match src.read(&mut chunk[..limit]) {
                Ok(0) => return Ok(false),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if is_timeout(&err) => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

/// Whether an I/O error is a read/write timeout rather than a failure.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Source that yields scripted chunks and timeouts.
    struct Scripted(VecDeque<Option<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(None) => Err(io::ErrorKind::WouldBlock.into()),
                Some(Some(mut bytes)) => {
                    let n = bytes.len().min(out.len());
                    out[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.0.push_front(Some(bytes.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    #[rstest]
    fn encode_frame_enforces_limit() {
        let err = encode_frame(&[0u8; 32], 16).expect_err("payload too large");
        assert!(matches!(err, FrameError::TooLarge { size: 32, max: 16 }));
    }

    #[rstest]
    fn encode_frame_prefixes_length() {
        let framed = encode_frame(&[1, 2, 3], 16).expect("payload fits frame");
        assert_eq!(&framed[..4], &3u32.to_be_bytes());
        assert_eq!(&framed[4..], &[1, 2, 3]);
    }

    #[rstest]
    fn reader_yields_frames_then_done_then_eof() {
        let mut bytes = Preamble::new(Mode::Stream).encode().to_vec();
        bytes.extend(encode_frame(b"one", 16).unwrap());
        bytes.extend(encode_frame(b"two", 16).unwrap());
        bytes.extend(done_frame());
        let mut src = Cursor::new(bytes);
        let mut reader = FrameReader::new(16);

        let preamble = reader.poll_preamble(&mut src).unwrap();
        assert_eq!(preamble, Some(Preamble::new(Mode::Stream)));
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Frame(b"one".to_vec()));
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Frame(b"two".to_vec()));
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Done);
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Eof);
    }

    #[rstest]
    fn partial_frames_survive_timeouts() {
        let framed = encode_frame(b"split", 16).unwrap();
        let mut src = Scripted(VecDeque::from([
            Some(framed[..2].to_vec()),
            None,
            Some(framed[2..6].to_vec()),
            None,
            Some(framed[6..].to_vec()),
        ]));
        let mut reader = FrameReader::new(16);
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Pending);
        assert_eq!(reader.poll(&mut src).unwrap(), FramePoll::Pending);
        assert_eq!(
            reader.poll(&mut src).unwrap(),
            FramePoll::Frame(b"split".to_vec())
        );
    }

    #[rstest]
    fn oversized_declared_length_is_rejected() {
        let mut src = Cursor::new(1024u32.to_be_bytes().to_vec());
        let err = FrameReader::new(16).poll(&mut src).expect_err("too large");
        assert!(matches!(err, FrameError::TooLarge { size: 1024, .. }));
    }

    #[rstest]
    fn eof_inside_frame_is_truncation() {
        let mut src = Cursor::new(vec![0, 0, 0, 9, b'x']);
        let err = FrameReader::new(16).poll(&mut src).expect_err("truncated");
        assert!(matches!(err, FrameError::Truncated));
    }

    #[rstest]
    #[case(b"FRLY\x03".as_slice(), "unknown relay mode")]
    #[case(b"HTTP/".as_slice(), "not a relay preamble")]
    fn bad_preambles_are_rejected(#[case] bytes: &[u8], #[case] expected: &str) {
        let err = Preamble::parse(bytes).expect_err("invalid preamble");
        assert!(err.to_string().contains(expected), "{err}");
    }
}
