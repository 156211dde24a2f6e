//! HTTP request: incremental server-side parser and client-side sender.

use std::collections::HashMap;
use std::mem;
use std::path::Path;
use std::time::Duration;

use log::trace;

use crate::fs::{File, OpenMode};
use crate::http::{
    body_kind, contains_key_ci, find_crlf, split_header_line, BodyDecoder, HeaderMap, Method, CRLF,
    HEADER_SEP,
};
use crate::net::Io;
use crate::{Error, Result};

/// Bytes to ask for per receive cycle while a parse is incomplete.
const RECV_WANT: usize = Io::BUF_MAX_SIZE;

/// Drain budget applied when a keep-alive cycle ends with the body
/// still unread.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// An HTTP/1.1 request tied to a connection.
///
/// One value serves both directions: a server parses into it from the
/// socket, a client composes into it and sends. Parsing is incremental
/// and lazy — [`parse`] consumes the request line and headers only;
/// the body is read when [`parse_body`] or [`save_to_file`] asks for
/// it, and [`clear`] drains a skipped body with a short timeout before
/// the connection is reused.
///
/// Parsed header keys are lowercase; values keep their case.
///
/// [`parse`]: Request::parse
/// [`parse_body`]: Request::parse_body
/// [`save_to_file`]: Request::save_to_file
/// [`clear`]: Request::clear
pub struct Request<'a> {
    io: &'a Io,
    rbuf: Vec<u8>,
    scratch: Vec<u8>,
    method: String,
    path: String,
    version: String,
    line_done: bool,
    headers: HeaderMap,
    last_key: Option<String>,
    head_done: bool,
    body: Vec<u8>,
    decoder: Option<BodyDecoder>,
    body_done: bool,
}

impl<'a> Request<'a> {
    pub fn new(io: &'a Io) -> Request<'a> {
        Request {
            io,
            rbuf: Vec::new(),
            scratch: Vec::new(),
            method: String::new(),
            path: String::new(),
            version: String::new(),
            line_done: false,
            headers: HeaderMap::new(),
            last_key: None,
            head_done: false,
            body: Vec::new(),
            decoder: None,
            body_done: false,
        }
    }

    pub fn io(&self) -> &'a Io {
        self.io
    }

    // ===== client side =====

    /// Sets the request line; the protocol is always `HTTP/1.1`.
    pub fn set_req_line(&mut self, method: Method, path: &str) -> &mut Self {
        self.method = method.as_str().to_string();
        self.path = path.to_string();
        self.version = "HTTP/1.1".to_string();
        self.line_done = true;
        self
    }

    /// Inserts a header, replacing any previous value for the key.
    pub fn add_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Inserts a header only when the key (compared case-insensitively)
    /// is not present yet.
    pub fn try_add_header(&mut self, key: &str, value: &str) -> &mut Self {
        if !contains_key_ci(&self.headers, key) {
            self.headers.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Merges a whole header map.
    pub fn add_headers(&mut self, headers: HeaderMap) -> &mut Self {
        for (key, value) in headers {
            self.headers.insert(key, value);
        }
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>) -> &mut Self {
        self.body = body;
        self
    }

    /// Sends the composed request. `Content-Length` is appended iff a
    /// body is present; adding it by hand is a caller bug.
    pub async fn send(&self, timeout: Duration) -> Result<()> {
        debug_assert!(
            !contains_key_ci(&self.headers, "content-length"),
            "Content-Length is added automatically"
        );
        let mut buf = Vec::with_capacity(256);
        self.build_head(&mut buf);
        if self.body.is_empty() {
            buf.extend_from_slice(CRLF);
            self.io.send_link_timeout(&buf, timeout).await
        } else {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(self.body.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n\r\n");
            self.io.send_link_timeout(&buf, timeout).await?;
            self.io.send_link_timeout(&self.body, timeout).await
        }
    }

    /// Streams a file as the request body with chunked transfer
    /// coding, 4 KiB per chunk, closing with the zero chunk.
    pub async fn send_chunked<P: AsRef<Path>>(&mut self, path: P, timeout: Duration) -> Result<()> {
        debug_assert!(
            !contains_key_ci(&self.headers, "content-length"),
            "chunked requests carry no Content-Length"
        );
        let file = File::open(path, OpenMode::Read, self.io.handle()).await?;
        self.headers
            .insert("Transfer-Encoding".to_string(), "chunked".to_string());

        let mut buf = Vec::with_capacity(256);
        self.build_head(&mut buf);
        buf.extend_from_slice(CRLF);
        self.io.send_link_timeout(&buf, timeout).await?;

        let mut data = vec![0u8; File::BUF_MAX_SIZE];
        loop {
            let n = file.read(&mut data).await?;
            if n == 0 {
                self.io.send_link_timeout(b"0\r\n\r\n", timeout).await?;
                break;
            }
            let size_line = format!("{:X}\r\n", n);
            self.io
                .send_link_timeout(size_line.as_bytes(), timeout)
                .await?;
            self.io.send_link_timeout(&data[..n], timeout).await?;
            self.io.send_link_timeout(CRLF, timeout).await?;
        }
        file.close().await
    }

    fn build_head(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.method.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(CRLF);
        for (key, value) in &self.headers {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(HEADER_SEP);
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF);
        }
    }

    // ===== server side =====

    /// Parses the request line and headers from the socket.
    ///
    /// Returns `Ok(false)` when the peer disconnected or the receive
    /// timed out before a complete head arrived, so keep-alive loops
    /// can unwind quietly.
    pub async fn parse(&mut self, timeout: Duration) -> Result<bool> {
        loop {
            let want = self.parse_head_step()?;
            if want == 0 {
                if self.decoder.is_none() {
                    self.decoder = Some(BodyDecoder::new(body_kind(&self.headers)?));
                }
                trace!("request head complete; {} {}", self.method, self.path);
                return Ok(true);
            }
            self.scratch.resize(want.min(RECV_WANT), 0);
            match self.io.recv_link_timeout(&mut self.scratch, timeout).await? {
                None | Some(0) => return Ok(false),
                Some(n) => self.rbuf.extend_from_slice(&self.scratch[..n]),
            }
        }
    }

    /// One head-parse step over the buffered bytes. Returns how many
    /// more bytes are wanted; `0` means the head is complete.
    fn parse_head_step(&mut self) -> Result<usize> {
        if !self.line_done {
            let pos = match find_crlf(&self.rbuf) {
                Some(pos) => pos,
                None => return Ok(RECV_WANT),
            };
            {
                let line = std::str::from_utf8(&self.rbuf[..pos])
                    .map_err(|_| Error::Protocol("malformed request line"))?;
                let mut parts = line.split(' ');
                let method = parts.next().unwrap_or("");
                let path = parts.next().unwrap_or("");
                let version = parts.next().unwrap_or("");
                if method.is_empty() || path.is_empty() || version.is_empty() {
                    return Err(Error::Protocol("malformed request line"));
                }
                self.method = method.to_string();
                self.path = path.to_string();
                self.version = version.to_string();
            }
            self.rbuf.drain(..pos + 2);
            self.line_done = true;
        }
        while !self.head_done {
            let pos = match find_crlf(&self.rbuf) {
                Some(pos) => pos,
                None => return Ok(RECV_WANT),
            };
            if pos == 0 {
                self.rbuf.drain(..2);
                self.head_done = true;
                break;
            }
            match split_header_line(&self.rbuf[..pos]) {
                Some((key, value)) => {
                    self.last_key = Some(key.clone());
                    self.headers.insert(key, value);
                }
                None => {
                    // Folded continuation of the previous header.
                    let key = self
                        .last_key
                        .as_ref()
                        .ok_or(Error::Protocol("header continuation without a header"))?;
                    let tail = std::str::from_utf8(&self.rbuf[..pos])
                        .map_err(|_| Error::Protocol("malformed header line"))?;
                    self.headers
                        .get_mut(key)
                        .expect("last_key tracks an inserted header")
                        .push_str(tail);
                }
            }
            self.rbuf.drain(..pos + 2);
        }
        Ok(0)
    }

    /// Reads the body according to the parsed headers and returns it.
    pub async fn parse_body(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if self.body_done {
            return Err(Error::Protocol("body already consumed"));
        }
        self.body_done = true;
        loop {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or(Error::Protocol("body requested before the head"))?;
            let want = decoder.step(&mut self.rbuf, &mut self.body)?;
            if want == 0 {
                break;
            }
            self.scratch.resize(want.min(RECV_WANT), 0);
            match self.io.recv_link_timeout(&mut self.scratch, timeout).await? {
                None => return Err(Error::Timeout),
                Some(0) => return Err(Error::PeerClosed),
                Some(n) => self.rbuf.extend_from_slice(&self.scratch[..n]),
            }
        }
        Ok(mem::take(&mut self.body))
    }

    /// Streams the body straight into a file, bypassing the in-memory
    /// buffer.
    pub async fn save_to_file<P: AsRef<Path>>(&mut self, path: P, timeout: Duration) -> Result<()> {
        if self.body_done {
            return Err(Error::Protocol("body already consumed"));
        }
        self.body_done = true;
        let file = File::open(path, OpenMode::Write, self.io.handle()).await?;
        let mut out = Vec::new();
        loop {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or(Error::Protocol("body requested before the head"))?;
            let want = decoder.step(&mut self.rbuf, &mut out)?;
            if !out.is_empty() {
                file.write(&out).await?;
                out.clear();
            }
            if want == 0 {
                break;
            }
            self.scratch.resize(want.min(RECV_WANT), 0);
            match self.io.recv_link_timeout(&mut self.scratch, timeout).await? {
                None => return Err(Error::Timeout),
                Some(0) => return Err(Error::PeerClosed),
                Some(n) => self.rbuf.extend_from_slice(&self.scratch[..n]),
            }
        }
        file.close().await
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw request path, query string included.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path with any query string stripped.
    pub fn pure_path(&self) -> &str {
        match self.path.find('?') {
            Some(pos) => &self.path[..pos],
            None => &self.path,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Parses `?a=1&b=2&flag` query parameters on demand. A key
    /// without `=` maps to the empty string.
    pub fn query_params(&self) -> HashMap<String, String> {
        let query = match self.path.find('?') {
            Some(pos) => &self.path[pos + 1..],
            None => return HashMap::new(),
        };
        let mut params = HashMap::new();
        for item in query.split('&') {
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => params.insert(key.to_string(), value.to_string()),
                None => params.insert(item.to_string(), String::new()),
            };
        }
        params
    }

    /// Resets for the next keep-alive cycle. A body that was never
    /// consumed is drained first with a short timeout; a peer that
    /// cannot finish it within the budget forfeits the connection.
    pub async fn clear(&mut self) {
        if self.head_done && !self.body_done {
            let _ = self.parse_body(DRAIN_TIMEOUT).await;
        }
        self.rbuf.clear();
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.line_done = false;
        self.headers.clear();
        self.last_key = None;
        self.head_done = false;
        self.body.clear();
        self.decoder = None;
        self.body_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use crate::EventLoop;

    fn leaked_io() -> &'static Io {
        let ev = EventLoop::new().unwrap();
        Box::leak(Box::new(Io::new(sys::INVALID_SOCKET, ev.handle())))
    }

    fn parsed(input: &[u8]) -> Request<'static> {
        let mut req = Request::new(leaked_io());
        req.rbuf.extend_from_slice(input);
        assert_eq!(req.parse_head_step().unwrap(), 0);
        req
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = parsed(b"GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/a?x=1");
        assert_eq!(req.pure_path(), "/a");
        assert_eq!(req.version(), "HTTP/1.1");
        assert_eq!(req.headers().get("host").unwrap(), "example.com");
        assert_eq!(req.headers().get("accept").unwrap(), "*/*");
    }

    #[test]
    fn header_keys_are_lowercased_values_keep_case() {
        let req = parsed(b"GET / HTTP/1.1\r\nX-MiXeD: CaSe\r\n\r\n");
        assert!(req.headers().keys().all(|k| k.chars().all(|c| !c.is_ascii_uppercase())));
        assert_eq!(req.headers().get("x-mixed").unwrap(), "CaSe");
    }

    #[test]
    fn folded_header_appends_continuations() {
        let req = parsed(
            b"GET / HTTP/1.1\r\nX-Long: part1\r\n part2\r\n part3\r\nHost: h\r\n\r\n",
        );
        assert_eq!(req.headers().get("x-long").unwrap(), "part1 part2 part3");
        assert_eq!(req.headers().get("host").unwrap(), "h");
    }

    #[test]
    fn incremental_head_parse_asks_for_more() {
        let mut req = Request::new(leaked_io());
        req.rbuf.extend_from_slice(b"GET / HT");
        assert!(req.parse_head_step().unwrap() > 0);
        req.rbuf.extend_from_slice(b"TP/1.1\r\nHost: h\r");
        assert!(req.parse_head_step().unwrap() > 0);
        req.rbuf.extend_from_slice(b"\n\r\n");
        assert_eq!(req.parse_head_step().unwrap(), 0);
        assert_eq!(req.headers().get("host").unwrap(), "h");
    }

    #[test]
    fn malformed_request_line_is_fatal() {
        let mut req = Request::new(leaked_io());
        req.rbuf.extend_from_slice(b"NOSPACES\r\n");
        assert!(req.parse_head_step().is_err());
    }

    #[test]
    fn query_parameters() {
        let req = parsed(b"GET /home?name=loli&awa=ok&hitori HTTP/1.1\r\n\r\n");
        let params = req.query_params();
        assert_eq!(params.get("name").unwrap(), "loli");
        assert_eq!(params.get("awa").unwrap(), "ok");
        assert_eq!(params.get("hitori").unwrap(), "");
        assert!(parsed(b"GET /plain HTTP/1.1\r\n\r\n").query_params().is_empty());
    }

    #[test]
    fn composed_head_has_line_headers_and_no_stray_crlf() {
        let io = leaked_io();
        let mut req = Request::new(io);
        req.set_req_line(Method::Get, "/x").add_header("Host", "h");
        let mut buf = Vec::new();
        req.build_head(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(text.contains("Host: h\r\n"));
        assert!(!text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parse_of_a_composed_request_round_trips() {
        let mut req = Request::new(leaked_io());
        req.set_req_line(Method::Post, "/submit")
            .add_header("Host", "example.com")
            .add_header("X-Token", "AbC");
        let mut wire = Vec::new();
        req.build_head(&mut wire);
        wire.extend_from_slice(b"\r\n");

        let mut parsed = Request::new(leaked_io());
        parsed.rbuf.extend_from_slice(&wire);
        assert_eq!(parsed.parse_head_step().unwrap(), 0);
        // Equal modulo key case: parsed keys are lowercased, values
        // and the request line survive byte-for-byte.
        assert_eq!(parsed.method(), "POST");
        assert_eq!(parsed.path(), "/submit");
        assert_eq!(parsed.version(), "HTTP/1.1");
        assert_eq!(parsed.headers().get("host").unwrap(), "example.com");
        assert_eq!(parsed.headers().get("x-token").unwrap(), "AbC");
        assert_eq!(parsed.headers().len(), req.headers.len());
    }
}
