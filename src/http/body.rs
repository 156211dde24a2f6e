//! Message body decoding, shared by the request and response parsers.

use crate::http::{find_crlf, HeaderMap};
use crate::net::Io;
use crate::{Error, Result};

/// How the headers delimit the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No `content-length` and no chunked transfer coding: no body.
    None,
    /// Exactly this many bytes follow the head.
    Sized(u64),
    /// `transfer-encoding: chunked`.
    Chunked,
}

/// Dispatches on a parsed (lowercased-key) header map.
pub(crate) fn body_kind(headers: &HeaderMap) -> Result<BodyKind> {
    if let Some(value) = headers.get("content-length") {
        let n = value
            .trim()
            .parse()
            .map_err(|_| Error::Protocol("invalid content-length"))?;
        return Ok(BodyKind::Sized(n));
    }
    if let Some(value) = headers.get("transfer-encoding") {
        if value.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyKind::Chunked);
        }
    }
    Ok(BodyKind::None)
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    /// Expecting a hex size line.
    SizeLine,
    /// Inside chunk data, this many bytes left.
    Data(u64),
    /// Expecting the CRLF that closes a chunk.
    Terminator,
    /// After the zero chunk: trailer lines are consumed and ignored
    /// until the blank line that ends the message.
    Trailers,
}

/// Incremental body decoder.
///
/// Fed from the connection's receive buffer; decoded bytes are pushed
/// into the caller's sink so the same machine serves both the in-memory
/// body and the save-to-file path. Chunk extensions are ignored past
/// the first `;`. After the zero chunk, trailer lines are consumed
/// syntactically but ignored, through the blank line that ends the
/// message — nothing of the framing is left in the buffer, which must
/// start clean for the next keep-alive request.
pub(crate) struct BodyDecoder {
    kind: BodyKind,
    chunk: ChunkState,
    done: bool,
}

impl BodyDecoder {
    pub(crate) fn new(kind: BodyKind) -> BodyDecoder {
        BodyDecoder {
            kind,
            chunk: ChunkState::SizeLine,
            done: matches!(kind, BodyKind::None | BodyKind::Sized(0)),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Consumes decodable bytes from the front of `buf`, appending the
    /// decoded payload to `out`. Returns how many more bytes are
    /// needed, `0` meaning the body is complete; the caller is free to
    /// read less per cycle.
    pub(crate) fn step(&mut self, buf: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<usize> {
        if self.done {
            return Ok(0);
        }
        match self.kind {
            BodyKind::None => {
                self.done = true;
                Ok(0)
            }
            BodyKind::Sized(remaining) => {
                let take = buf.len().min(remaining as usize);
                out.extend_from_slice(&buf[..take]);
                buf.drain(..take);
                let left = remaining - take as u64;
                self.kind = BodyKind::Sized(left);
                self.done = left == 0;
                Ok(left as usize)
            }
            BodyKind::Chunked => self.step_chunked(buf, out),
        }
    }

    fn step_chunked(&mut self, buf: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<usize> {
        loop {
            match self.chunk {
                ChunkState::SizeLine => {
                    let pos = match find_crlf(buf) {
                        Some(pos) => pos,
                        None => return Ok(Io::BUF_MAX_SIZE),
                    };
                    if pos == 0 {
                        // Dangling CRLF from the previous chunk.
                        buf.drain(..2);
                        continue;
                    }
                    let line = std::str::from_utf8(&buf[..pos])
                        .map_err(|_| Error::Protocol("invalid chunk size line"))?;
                    let digits = line.split(';').next().unwrap_or(line).trim();
                    let size = u64::from_str_radix(digits, 16)
                        .map_err(|_| Error::Protocol("invalid chunk size"))?;
                    buf.drain(..pos + 2);
                    self.chunk = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = buf.len().min(remaining as usize);
                    out.extend_from_slice(&buf[..take]);
                    buf.drain(..take);
                    let left = remaining - take as u64;
                    if left > 0 {
                        self.chunk = ChunkState::Data(left);
                        return Ok(left as usize);
                    }
                    self.chunk = ChunkState::Terminator;
                }
                ChunkState::Terminator => {
                    if buf.len() < 2 {
                        return Ok(Io::BUF_MAX_SIZE);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::Protocol("missing chunk terminator"));
                    }
                    buf.drain(..2);
                    self.chunk = ChunkState::SizeLine;
                }
                ChunkState::Trailers => {
                    let pos = match find_crlf(buf) {
                        Some(pos) => pos,
                        None => return Ok(Io::BUF_MAX_SIZE),
                    };
                    buf.drain(..pos + 2);
                    if pos == 0 {
                        self.done = true;
                        return Ok(0);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(kind: BodyKind, input: &[u8]) -> (Vec<u8>, bool) {
        let mut decoder = BodyDecoder::new(kind);
        let mut buf = input.to_vec();
        let mut out = Vec::new();
        decoder.step(&mut buf, &mut out).unwrap();
        (out, decoder.is_done())
    }

    #[test]
    fn sized_body() {
        let (out, done) = decode(BodyKind::Sized(4), b"abcdrest");
        assert_eq!(out, b"abcd");
        assert!(done);
    }

    #[test]
    fn sized_body_in_pieces() {
        let mut decoder = BodyDecoder::new(BodyKind::Sized(4));
        let mut out = Vec::new();
        let mut buf = b"ab".to_vec();
        assert_eq!(decoder.step(&mut buf, &mut out).unwrap(), 2);
        let mut buf = b"cd".to_vec();
        assert_eq!(decoder.step(&mut buf, &mut out).unwrap(), 0);
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn chunked_body() {
        let (out, done) = decode(BodyKind::Chunked, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert_eq!(out, b"Wikipedia");
        assert!(done);
    }

    #[test]
    fn chunked_zero_body_terminates() {
        // A zero-size first chunk completes the body the moment its own
        // line is consumed; no trailers are read.
        let (out, done) = decode(BodyKind::Chunked, b"0\r\n\r\n");
        assert!(out.is_empty());
        assert!(done);
    }

    #[test]
    fn chunked_extensions_are_ignored() {
        let (out, done) = decode(BodyKind::Chunked, b"4;name=val\r\nWiki\r\n0\r\n\r\n");
        assert_eq!(out, b"Wiki");
        assert!(done);
    }

    #[test]
    fn trailers_are_consumed_but_ignored() {
        let mut decoder = BodyDecoder::new(BodyKind::Chunked);
        let mut buf = b"2\r\nok\r\n0\r\nExpires: never\r\n\r\nGET".to_vec();
        let mut out = Vec::new();
        assert_eq!(decoder.step(&mut buf, &mut out).unwrap(), 0);
        assert_eq!(out, b"ok");
        assert!(decoder.is_done());
        // The framing is fully consumed; pipelined bytes survive.
        assert_eq!(buf, b"GET");
    }

    #[test]
    fn chunked_split_across_reads() {
        let mut decoder = BodyDecoder::new(BodyKind::Chunked);
        let mut out = Vec::new();
        let mut buf = b"6\r\nab".to_vec();
        assert!(decoder.step(&mut buf, &mut out).unwrap() > 0);
        buf.extend_from_slice(b"cdef");
        assert!(decoder.step(&mut buf, &mut out).unwrap() > 0);
        buf.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(decoder.step(&mut buf, &mut out).unwrap(), 0);
        assert_eq!(out, b"abcdef");
        assert!(decoder.is_done());
    }

    #[test]
    fn bad_chunk_size_is_fatal() {
        let mut decoder = BodyDecoder::new(BodyKind::Chunked);
        let mut buf = b"xyz\r\n".to_vec();
        let mut out = Vec::new();
        assert!(decoder.step(&mut buf, &mut out).is_err());
    }

    #[test]
    fn kind_dispatch() {
        let mut headers = HeaderMap::new();
        assert_eq!(body_kind(&headers).unwrap(), BodyKind::None);
        headers.insert("content-length".into(), "10".into());
        assert_eq!(body_kind(&headers).unwrap(), BodyKind::Sized(10));
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding".into(), "chunked".into());
        assert_eq!(body_kind(&headers).unwrap(), BodyKind::Chunked);
    }
}
